//! Action log
//!
//! The log is a fixed set of lanes in the pool. A publish borrows one lane
//! for its whole duration:
//!
//! 1. write the batch's redo entries to the lane and flush them
//! 2. flush the caller's payloads
//! 3. write the lane's commit word (CRC + count) and flush it: the batch is
//!    now durable
//! 4. apply every entry to its target word and flush it
//! 5. zero the commit word and flush it
//!
//! On open, every lane with a non-zero commit word is replayed (steps 4-5).
//! A crash before step 3 leaves nothing to replay.
//!
//! If step 4 or 5 fails, the lane keeps its commit word and is stranded:
//! it leaves the lane pool and every later publish fails with
//! `RecoveryRequired` until [`ActionLog::recover`] replays it. Replaying a
//! stranded batch after younger batches would undo them, so nothing else
//! may publish first.

mod redo;

pub use redo::{commit_word, encode_entries, RedoEntry, RedoOp, RedoRecordError};

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use pmobj_core::layout::{LANES_OFFSET, LANE_CAPACITY, LANE_COUNT, LANE_ENTRIES_OFFSET, LANE_SIZE, REDO_ENTRY_SIZE};
use pmobj_core::{Error, PersistentMemory, Result};
use tracing::{debug, info, warn};

use crate::testing::CrashPoint;

/// Outcome of replaying the lanes at open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Lanes that held a committed batch
    pub lanes_replayed: usize,
    /// Entries applied across those lanes
    pub entries_applied: usize,
}

/// How far a publish got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// All steps done, lane cleared
    Completed,
    /// Stopped at a crash point; the lane is left as a crash would leave it
    Interrupted(CrashPoint),
}

/// Redo log over the pool's lanes
pub struct ActionLog {
    mem: Arc<dyn PersistentMemory>,
    free: Mutex<Vec<usize>>,
    stranded: Mutex<Vec<usize>>,
    available: Condvar,
}

fn lane_offset(lane: usize) -> u64 {
    LANES_OFFSET + lane as u64 * LANE_SIZE
}

impl ActionLog {
    /// Log over the lanes of `mem`
    pub fn new(mem: Arc<dyn PersistentMemory>) -> Self {
        ActionLog {
            mem,
            free: Mutex::new((0..LANE_COUNT).rev().collect()),
            stranded: Mutex::new(Vec::new()),
            available: Condvar::new(),
        }
    }

    /// Largest batch a single publish can log
    pub const fn capacity() -> usize {
        LANE_CAPACITY
    }

    /// Replay every committed lane and clear it
    ///
    /// # Errors
    ///
    /// Returns `Corruption` if a commit word does not match its entries.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        for lane in 0..LANE_COUNT {
            let word = self.mem.read_u64(lane_offset(lane))?;
            if word == 0 {
                continue;
            }
            let entries = self.read_committed(lane, word)?;
            self.apply(&entries)?;
            self.clear(lane)?;
            stats.lanes_replayed += 1;
            stats.entries_applied += entries.len();
        }
        let released: Vec<usize> = self.stranded.lock().drain(..).collect();
        if !released.is_empty() {
            self.free.lock().extend(released);
            self.available.notify_all();
        }
        if stats.lanes_replayed > 0 {
            info!(
                target: "pmobj::log",
                lanes = stats.lanes_replayed,
                entries = stats.entries_applied,
                "Replayed committed batches"
            );
        }
        Ok(stats)
    }

    /// Durably apply `entries` as one atomic batch
    ///
    /// `flush_payloads` runs after the entries are logged and before the
    /// commit point; an error from it aborts the publish with no effect.
    /// Blocks while every lane is busy.
    ///
    /// # Errors
    ///
    /// - `BatchTooLarge` before touching the lane if the batch does not fit
    /// - `RecoveryRequired` while a stranded batch awaits replay
    /// - `CommittedNotApplied` if the batch became durable but applying it
    ///   failed; the lane is stranded and the next open replays it
    ///
    /// Any other error happened before the commit point and left no trace.
    pub fn publish<F>(&self, entries: &[RedoEntry], flush_payloads: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.publish_until(entries, flush_payloads, None).map(|_| ())
    }

    /// Like [`publish`](ActionLog::publish), stopping at `crash` if given
    pub fn publish_until<F>(
        &self,
        entries: &[RedoEntry],
        flush_payloads: F,
        crash: Option<CrashPoint>,
    ) -> Result<PublishOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        if entries.len() > LANE_CAPACITY {
            return Err(Error::BatchTooLarge {
                entries: entries.len(),
                capacity: LANE_CAPACITY,
            });
        }
        if let Some(lane) = self.stranded_lane() {
            return Err(Error::RecoveryRequired(lane));
        }
        let encoded = encode_entries(entries)?;
        let mut lane = self.acquire();
        self.run(&mut lane, entries, &encoded, flush_payloads, crash)
    }

    /// First lane holding a batch that failed to apply
    pub fn stranded_lane(&self) -> Option<usize> {
        self.stranded.lock().first().copied()
    }

    fn run<F>(
        &self,
        lane: &mut LaneGuard<'_>,
        entries: &[RedoEntry],
        encoded: &[u8],
        flush_payloads: F,
        crash: Option<CrashPoint>,
    ) -> Result<PublishOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        let stop = |point: CrashPoint| crash == Some(point);
        let base = lane_offset(lane.index);

        if !encoded.is_empty() {
            self.mem.write_persist(base + LANE_ENTRIES_OFFSET, encoded)?;
        }
        if stop(CrashPoint::AfterLogWrite) {
            return Ok(PublishOutcome::Interrupted(CrashPoint::AfterLogWrite));
        }

        flush_payloads()?;
        if stop(CrashPoint::AfterPayloadFlush) {
            return Ok(PublishOutcome::Interrupted(CrashPoint::AfterPayloadFlush));
        }
        if entries.is_empty() {
            return Ok(PublishOutcome::Completed);
        }

        // From the store on, the word may reach media whatever persist says.
        lane.stranded = true;
        let finished = self.commit_and_apply(lane.index, entries, encoded, stop);
        match finished {
            Ok(PublishOutcome::Completed) => {
                lane.stranded = false;
                debug!(target: "pmobj::log", lane = lane.index, entries = entries.len(), "Batch published");
                Ok(PublishOutcome::Completed)
            }
            Ok(interrupted) => Ok(interrupted),
            Err(e) => {
                warn!(
                    target: "pmobj::log",
                    lane = lane.index,
                    error = %e,
                    "Committed batch not applied, lane stranded until replay"
                );
                Err(Error::CommittedNotApplied(e.to_string()))
            }
        }
    }

    fn commit_and_apply(
        &self,
        lane: usize,
        entries: &[RedoEntry],
        encoded: &[u8],
        stop: impl Fn(CrashPoint) -> bool,
    ) -> Result<PublishOutcome> {
        let base = lane_offset(lane);
        self.mem.write_u64(base, commit_word(encoded, entries.len()))?;
        self.mem.persist(base, 8)?;
        if stop(CrashPoint::AfterCommit) {
            return Ok(PublishOutcome::Interrupted(CrashPoint::AfterCommit));
        }

        self.apply(entries)?;
        if stop(CrashPoint::AfterApply) {
            return Ok(PublishOutcome::Interrupted(CrashPoint::AfterApply));
        }

        self.clear(lane)?;
        Ok(PublishOutcome::Completed)
    }

    fn acquire(&self) -> LaneGuard<'_> {
        let mut free = self.free.lock();
        loop {
            if let Some(index) = free.pop() {
                return LaneGuard {
                    log: self,
                    index,
                    stranded: false,
                };
            }
            self.available.wait(&mut free);
        }
    }

    fn read_committed(&self, lane: usize, word: u64) -> Result<Vec<RedoEntry>> {
        let count = word & 0xffff_ffff;
        if count == 0 || count > LANE_CAPACITY as u64 {
            return Err(RedoRecordError::BadCount(count).into());
        }
        let mut encoded = vec![0u8; count as usize * REDO_ENTRY_SIZE as usize];
        self.mem
            .read(lane_offset(lane) + LANE_ENTRIES_OFFSET, &mut encoded)?;
        let computed = crc32fast::hash(&encoded);
        let expected = (word >> 32) as u32;
        if computed != expected {
            return Err(RedoRecordError::ChecksumMismatch { expected, computed }.into());
        }
        encoded
            .chunks_exact(REDO_ENTRY_SIZE as usize)
            .map(|chunk| RedoEntry::decode(chunk).map_err(Error::from))
            .collect()
    }

    fn apply(&self, entries: &[RedoEntry]) -> Result<()> {
        for entry in entries {
            let word = self.mem.atomic_u64(entry.offset)?;
            match entry.op {
                RedoOp::Set => word.store(entry.value, Ordering::Release),
                RedoOp::Or => {
                    word.fetch_or(entry.value, Ordering::AcqRel);
                }
                RedoOp::And => {
                    word.fetch_and(entry.value, Ordering::AcqRel);
                }
            }
            self.mem.persist(entry.offset, 8)?;
        }
        Ok(())
    }

    fn clear(&self, lane: usize) -> Result<()> {
        self.mem.write_u64(lane_offset(lane), 0)?;
        self.mem.persist(lane_offset(lane), 8)
    }
}

/// Borrowed lane; goes back to the pool on drop unless its commit word may be set
struct LaneGuard<'a> {
    log: &'a ActionLog,
    index: usize,
    stranded: bool,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        if self.stranded {
            self.log.stranded.lock().push(self.index);
            return;
        }
        self.log.free.lock().push(self.index);
        self.log.available.notify_one();
    }
}
