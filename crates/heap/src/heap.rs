//! The persistent heap
//!
//! Owns the volatile view of every zone: the free-chunk index, the span
//! table and the runs of each class. Media changes that make an object
//! visible or invisible are never written here; the heap only produces the
//! redo entries for them and updates its volatile state once the caller has
//! published those entries through the action log.
//!
//! # Locking
//!
//! - one mutex per class bucket (the runs of that class)
//! - one mutex for the chunk map (free index and span table)
//! - a visibility gate: publishers hold it shared while they log, apply and
//!   update volatile state, as do reserve and cancel while they write chunk
//!   headers; enumeration and `check` hold it exclusively
//!
//! A bucket may be locked before the chunk map, never after it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use pmobj_core::layout::{chunks_in_zone, zone_count, zone_offset, CHUNK_SIZE, MAX_CHUNKS_PER_ZONE};
use pmobj_core::{Error, PersistentMemory, Result};
use pmobj_durability::{RedoEntry, RedoOp};
use tracing::{debug, info, warn};

use crate::chunk::{
    chunk_containing, chunk_id, data_offset, header_offset, zone_of, ChunkHeader, ChunkId, ChunkKind,
    ZONE_MAGIC,
};
use crate::class::{AllocClass, AllocClassDesc, AllocClassRegistry, HeaderType, HUGE_CLASS_ID, MAX_CLASS_ID};
use crate::free_index::FreeIndex;
use crate::run::{bitmap_word_offset, mask, RunState};
use crate::stats::{HeapStats, HeapStatsSnapshot};

/// Header in front of every huge object
pub const HUGE_HEADER: HeaderType = HeaderType::Compact;

/// Where an object lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Block {
    /// A span of whole chunks
    Huge {
        /// First chunk
        chunk: ChunkId,
        /// Chunks spanned
        len: u32,
    },
    /// One unit of a run
    Run {
        /// First chunk of the run
        run: ChunkId,
        /// Unit index
        unit: u32,
        /// Bucket holding the run
        class_id: u8,
    },
}

/// Space claimed by `reserve`, invisible until published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Offset of the user data
    pub offset: u64,
    /// Usable bytes at `offset`
    pub usable: u64,
    /// Object header in front of the data
    pub header: HeaderType,
    /// Backing block
    pub block: Block,
}

impl Reservation {
    /// Header and data range, for flushing before publish
    pub fn extent(&self) -> (u64, u64) {
        (self.offset - self.header.size(), self.usable + self.header.size())
    }
}

/// Resolved object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Backing block
    pub block: Block,
    /// Object header type
    pub header: HeaderType,
    /// Usable bytes
    pub usable: u64,
    /// True once published
    pub published: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanKind {
    Huge { published: bool },
    Run { class_id: u8 },
}

#[derive(Debug, Clone, Copy)]
struct Span {
    len: u32,
    kind: SpanKind,
}

impl Span {
    fn header_word(&self) -> u64 {
        match self.kind {
            SpanKind::Huge { published: true } => ChunkHeader::used(self.len).encode(),
            SpanKind::Huge { published: false } => 0,
            SpanKind::Run { .. } => ChunkHeader::run(self.len).encode(),
        }
    }
}

#[derive(Debug, Default)]
struct ChunkMap {
    free: FreeIndex,
    spans: BTreeMap<ChunkId, Span>,
    /// Registered chunks per zone
    zone_chunks: Vec<u32>,
}

impl ChunkMap {
    fn take(&mut self, len: u32, kind: SpanKind) -> Option<ChunkId> {
        let start = self.free.take(len)?;
        self.spans.insert(start, Span { len, kind });
        Some(start)
    }

    fn give_back(&mut self, start: ChunkId) {
        if let Some(span) = self.spans.remove(&start) {
            self.free.insert(start, span.len);
        }
    }

    fn span_at(&self, chunk: ChunkId) -> Option<(ChunkId, Span)> {
        let (&start, &span) = self.spans.range(..=chunk).next_back()?;
        (chunk < start + span.len).then_some((start, span))
    }
}

#[derive(Debug, Default)]
struct Bucket {
    runs: BTreeMap<ChunkId, RunState>,
}

/// Chunks needed for a huge object of `size` bytes
fn huge_chunks(size: u64) -> Result<u32> {
    let total = size
        .checked_add(HUGE_HEADER.size())
        .ok_or(Error::OutOfSpace { requested: size })?;
    let chunks = (total + CHUNK_SIZE - 1) / CHUNK_SIZE;
    if chunks > MAX_CHUNKS_PER_ZONE as u64 {
        return Err(Error::OutOfSpace { requested: size });
    }
    Ok(chunks as u32)
}

/// Merge entries targeting the same word with the same operation
///
/// OR and AND operands combine; for SET the last value wins. The first
/// occurrence keeps its position.
pub fn merge_entries(entries: Vec<RedoEntry>) -> Vec<RedoEntry> {
    let mut merged: Vec<RedoEntry> = Vec::with_capacity(entries.len());
    let mut index: BTreeMap<(u64, u8), usize> = BTreeMap::new();
    for entry in entries {
        let key = (entry.offset, entry.op as u8);
        match index.get(&key) {
            Some(&i) => {
                let slot = &mut merged[i];
                slot.value = match entry.op {
                    RedoOp::Set => entry.value,
                    RedoOp::Or => slot.value | entry.value,
                    RedoOp::And => slot.value & entry.value,
                };
            }
            None => {
                index.insert(key, merged.len());
                merged.push(entry);
            }
        }
    }
    merged
}

/// Transactional object heap over a [`PersistentMemory`]
pub struct Heap {
    mem: Arc<dyn PersistentMemory>,
    classes: RwLock<AllocClassRegistry>,
    buckets: Vec<Mutex<Bucket>>,
    chunks: Mutex<ChunkMap>,
    gate: RwLock<()>,
    pending_free: Mutex<HashSet<u64>>,
    stats: HeapStats,
}

impl Heap {
    /// Load the heap from `mem`, formatting zones that were never used
    ///
    /// Empty runs left by a crash are returned to the free index.
    ///
    /// # Errors
    ///
    /// Returns `Corruption` for a bad zone magic, an unknown chunk kind, a
    /// span past the committed end or an invalid run header.
    pub fn open(mem: Arc<dyn PersistentMemory>, stats_enabled: bool) -> Result<Self> {
        let heap = Heap {
            mem,
            classes: RwLock::new(AllocClassRegistry::default()),
            buckets: (0..=MAX_CLASS_ID as usize).map(|_| Mutex::new(Bucket::default())).collect(),
            chunks: Mutex::new(ChunkMap::default()),
            gate: RwLock::new(()),
            pending_free: Mutex::new(HashSet::new()),
            stats: HeapStats::new(stats_enabled),
        };
        heap.load()?;
        Ok(heap)
    }

    fn load(&self) -> Result<()> {
        let committed = self.mem.committed();
        let zones = zone_count(committed);
        if zones == 0 {
            return Err(Error::Corruption(format!(
                "{} bytes cannot hold a single chunk",
                committed
            )));
        }
        let mut map = self.chunks.lock();
        let mut runs = Vec::new();
        let mut reclaimed = 0usize;
        for zone in 0..zones {
            self.init_zone(zone)?;
            let count = chunks_in_zone(zone, committed);
            let mut c = 0;
            while c < count {
                let id = chunk_id(zone, c);
                let word = self.mem.read_u64(header_offset(id))?;
                let header = ChunkHeader::decode(word).ok_or_else(|| {
                    Error::Corruption(format!("chunk {} has unknown header {:#x}", id, word))
                })?;
                if header.kind == ChunkKind::Free {
                    map.free.insert(id, 1);
                    c += 1;
                    continue;
                }
                let len = header.size_idx;
                if len == 0 || c + len > count {
                    return Err(Error::Corruption(format!(
                        "chunk {} spans {} chunks past the end of zone {}",
                        id, len, zone
                    )));
                }
                match header.kind {
                    ChunkKind::Used => {
                        map.spans.insert(id, Span { len, kind: SpanKind::Huge { published: true } });
                        self.stats.allocated(len as u64 * CHUNK_SIZE, false);
                    }
                    _ => {
                        let run = RunState::load(self.mem.as_ref(), id, len)?;
                        if run.is_empty() {
                            self.mem.write_u64(header_offset(id), 0)?;
                            self.mem.persist(header_offset(id), 8)?;
                            map.free.insert(id, len);
                            reclaimed += 1;
                        } else {
                            let class_id = run.class_id;
                            self.stats.run_created(run.span_bytes());
                            for _ in run.allocated_units() {
                                self.stats.allocated(run.unit_size, true);
                            }
                            map.spans.insert(id, Span { len, kind: SpanKind::Run { class_id } });
                            runs.push(run);
                        }
                    }
                }
                c += len;
            }
            map.zone_chunks.push(count);
        }
        info!(
            target: "pmobj::heap",
            zones,
            spans = map.spans.len(),
            free_chunks = map.free.total(),
            reclaimed_runs = reclaimed,
            "Heap loaded"
        );
        drop(map);
        for run in runs {
            self.buckets[run.class_id as usize].lock().runs.insert(run.start, run);
        }
        Ok(())
    }

    fn init_zone(&self, zone: u32) -> Result<()> {
        let at = zone_offset(zone);
        match self.mem.read_u64(at)? {
            ZONE_MAGIC => Ok(()),
            0 => {
                self.mem.write_u64(at, ZONE_MAGIC)?;
                self.mem.persist(at, 8)
            }
            other => Err(Error::Corruption(format!("zone {} has bad magic {:#x}", zone, other))),
        }
    }

    /// Register chunks the store gained since the last call
    ///
    /// Returns the number of chunks added.
    pub fn extend(&self) -> Result<u64> {
        let committed = self.mem.committed();
        let mut map = self.chunks.lock();
        let mut added = 0u64;
        for zone in 0..zone_count(committed) {
            let count = chunks_in_zone(zone, committed);
            let known = match map.zone_chunks.get(zone as usize) {
                Some(&known) => known,
                None => {
                    self.init_zone(zone)?;
                    map.zone_chunks.push(0);
                    0
                }
            };
            if count > known {
                map.free.insert(chunk_id(zone, known), count - known);
                map.zone_chunks[zone as usize] = count;
                added += (count - known) as u64;
            }
        }
        if added > 0 {
            debug!(target: "pmobj::heap", chunks = added, committed, "Heap extended");
        }
        Ok(added)
    }

    /// Class that serves `size` bytes; `None` means huge
    fn choose_class(&self, size: u64, class: Option<u8>) -> Result<Option<AllocClass>> {
        let classes = self.classes.read();
        match class {
            Some(HUGE_CLASS_ID) => Ok(None),
            Some(id) => {
                let found = classes
                    .get(id)
                    .ok_or_else(|| Error::InvalidArgument(format!("no allocation class {}", id)))?;
                if found.max_request() < size {
                    return Err(Error::InvalidArgument(format!(
                        "class {} holds at most {} bytes, {} requested",
                        id,
                        found.max_request(),
                        size
                    )));
                }
                Ok(Some(*found))
            }
            None => Ok(classes.best_default(size).copied()),
        }
    }

    /// Claim space for an object of `size` bytes
    ///
    /// Writes the object header (size and `type_num`) and optionally zeroes
    /// the data. Nothing becomes visible until the entries from
    /// [`alloc_entry`](Heap::alloc_entry) are published.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero size or an unusable class id,
    /// `OutOfSpace` when no free block fits.
    pub fn reserve(&self, size: u64, type_num: u64, class: Option<u8>, zero: bool) -> Result<Reservation> {
        if size == 0 {
            return Err(Error::InvalidArgument("allocation size must be non-zero".into()));
        }
        let _visible = self.visibility();
        let res = match self.choose_class(size, class)? {
            Some(class) => self.reserve_unit(&class, size)?,
            None => self.reserve_huge(size)?,
        };
        if let Err(e) = self.write_object_header(&res, type_num, zero) {
            self.unreserve(&res.block);
            return Err(e);
        }
        Ok(res)
    }

    fn reserve_huge(&self, size: u64) -> Result<Reservation> {
        let len = huge_chunks(size)?;
        let chunk = self
            .chunks
            .lock()
            .take(len, SpanKind::Huge { published: false })
            .ok_or(Error::OutOfSpace { requested: size })?;
        Ok(Reservation {
            offset: data_offset(chunk) + HUGE_HEADER.size(),
            usable: len as u64 * CHUNK_SIZE - HUGE_HEADER.size(),
            header: HUGE_HEADER,
            block: Block::Huge { chunk, len },
        })
    }

    fn reserve_unit(&self, class: &AllocClass, size: u64) -> Result<Reservation> {
        let mut bucket = self.buckets[class.id as usize].lock();
        for run in bucket.runs.values_mut().filter(|r| r.matches(class)) {
            if let Some(unit) = run.claim() {
                return Ok(unit_reservation(run, unit));
            }
        }

        let start = self
            .chunks
            .lock()
            .take(class.run_chunks, SpanKind::Run { class_id: class.id })
            .ok_or(Error::OutOfSpace { requested: size })?;
        let mut run = RunState::new(start, class);
        if let Err(e) = self.format_run(&run) {
            self.chunks.lock().give_back(start);
            return Err(e);
        }
        self.stats.run_created(run.span_bytes());
        debug!(
            target: "pmobj::heap",
            class = class.id,
            chunk = start,
            chunks = class.run_chunks,
            units = class.units,
            "Run created"
        );
        let unit = run
            .claim()
            .ok_or_else(|| Error::Corruption(format!("fresh run at chunk {} has no free unit", start)))?;
        let res = unit_reservation(&run, unit);
        bucket.runs.insert(start, run);
        Ok(res)
    }

    /// Run header and bitmap first, then the chunk header that makes the run exist
    fn format_run(&self, run: &RunState) -> Result<()> {
        run.format(self.mem.as_ref())?;
        let at = header_offset(run.start);
        self.mem.write_u64(at, ChunkHeader::run(run.run_chunks).encode())?;
        self.mem.persist(at, 8)
    }

    fn write_object_header(&self, res: &Reservation, type_num: u64, zero: bool) -> Result<()> {
        let size = res.header.size();
        if size > 0 {
            let mut header = vec![0u8; size as usize];
            header[0..8].copy_from_slice(&res.usable.to_le_bytes());
            header[8..16].copy_from_slice(&type_num.to_le_bytes());
            self.mem.write(res.offset - size, &header)?;
        }
        if zero {
            self.mem.fill(res.offset, res.usable, 0)?;
        }
        Ok(())
    }

    /// Redo entry that makes a reservation visible
    pub fn alloc_entry(&self, res: &Reservation) -> RedoEntry {
        match res.block {
            Block::Huge { chunk, len } => RedoEntry::set(header_offset(chunk), ChunkHeader::used(len).encode()),
            Block::Run { run, unit, .. } => RedoEntry::or(bitmap_word_offset(run, unit), mask(unit)),
        }
    }

    /// Redo entry that releases a published block
    pub fn free_entry(&self, block: &Block) -> RedoEntry {
        match *block {
            Block::Huge { chunk, .. } => RedoEntry::set(header_offset(chunk), 0),
            Block::Run { run, unit, .. } => RedoEntry::and(bitmap_word_offset(run, unit), !mask(unit)),
        }
    }

    /// Shared hold on the visibility gate, taken for the whole of a publish
    pub fn visibility(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    /// Volatile side of a published reservation
    pub fn commit(&self, block: &Block) {
        match *block {
            Block::Huge { chunk, len } => {
                if let Some(span) = self.chunks.lock().spans.get_mut(&chunk) {
                    span.kind = SpanKind::Huge { published: true };
                }
                self.stats.allocated(len as u64 * CHUNK_SIZE, false);
            }
            Block::Run { run, unit, class_id } => {
                let mut bucket = self.buckets[class_id as usize].lock();
                if let Some(state) = bucket.runs.get_mut(&run) {
                    state.commit(unit);
                    self.stats.allocated(state.unit_size, true);
                }
            }
        }
    }

    /// Drop an unpublished reservation
    ///
    /// Takes the visibility gate shared, so the caller must not hold it.
    pub fn cancel(&self, block: &Block) {
        let _visible = self.visibility();
        self.unreserve(block);
    }

    fn unreserve(&self, block: &Block) {
        match *block {
            Block::Huge { chunk, .. } => self.chunks.lock().give_back(chunk),
            Block::Run { run, unit, class_id } => {
                let mut bucket = self.buckets[class_id as usize].lock();
                if let Some(state) = bucket.runs.get_mut(&run) {
                    state.unreserve(unit);
                }
                self.reclaim_if_empty(&mut bucket, run);
            }
        }
    }

    /// Volatile side of a published free
    pub fn release(&self, block: &Block) {
        match *block {
            Block::Huge { chunk, len } => {
                self.chunks.lock().give_back(chunk);
                self.stats.freed(len as u64 * CHUNK_SIZE, false);
            }
            Block::Run { run, unit, class_id } => {
                let mut bucket = self.buckets[class_id as usize].lock();
                if let Some(state) = bucket.runs.get_mut(&run) {
                    state.release(unit);
                    self.stats.freed(state.unit_size, true);
                }
                self.reclaim_if_empty(&mut bucket, run);
            }
        }
    }

    /// Return an empty run to the chunk pool unless it is the last run of its bucket
    fn reclaim_if_empty(&self, bucket: &mut Bucket, start: ChunkId) {
        let empty = bucket.runs.get(&start).map_or(false, RunState::is_empty);
        if !empty || bucket.runs.len() < 2 {
            return;
        }
        let at = header_offset(start);
        if let Err(e) = self.mem.write_u64(at, 0) {
            warn!(target: "pmobj::heap", chunk = start, error = %e, "Failed to clear empty run header");
            return;
        }
        // The header already reads as free, so the run must go either way.
        if let Err(e) = self.mem.persist(at, 8) {
            warn!(target: "pmobj::heap", chunk = start, error = %e, "Failed to flush cleared run header");
        }
        if let Some(run) = bucket.runs.remove(&start) {
            self.stats.run_reclaimed(run.span_bytes());
        }
        self.chunks.lock().give_back(start);
        debug!(target: "pmobj::heap", chunk = start, "Empty run reclaimed");
    }

    /// Resolve the object whose data starts at `offset`
    ///
    /// Unpublished reservations resolve only if `include_reserved`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if no such object exists.
    pub fn object(&self, offset: u64, include_reserved: bool) -> Result<ObjectInfo> {
        let not_found = || Error::InvalidArgument(format!("no object at offset {:#x}", offset));
        let chunk = chunk_containing(offset).ok_or_else(not_found)?;
        let (start, span) = self.chunks.lock().span_at(chunk).ok_or_else(not_found)?;
        match span.kind {
            SpanKind::Huge { published } => {
                if offset != data_offset(start) + HUGE_HEADER.size() || !(published || include_reserved) {
                    return Err(not_found());
                }
                Ok(ObjectInfo {
                    block: Block::Huge { chunk: start, len: span.len },
                    header: HUGE_HEADER,
                    usable: self.mem.read_u64(offset - HUGE_HEADER.size())?,
                    published,
                })
            }
            SpanKind::Run { class_id } => {
                let bucket = self.buckets[class_id as usize].lock();
                let run = bucket.runs.get(&start).ok_or_else(not_found)?;
                let unit = run.unit_at(offset).ok_or_else(not_found)?;
                let published = run.is_allocated(unit);
                if !(published || (include_reserved && run.is_reserved(unit))) {
                    return Err(not_found());
                }
                let usable = match run.header {
                    HeaderType::None => run.unit_size,
                    header => self.mem.read_u64(offset - header.size())?,
                };
                Ok(ObjectInfo {
                    block: Block::Run { run: start, unit, class_id },
                    header: run.header,
                    usable,
                    published,
                })
            }
        }
    }

    /// Type number stored in the object header (0 without a header)
    pub fn type_num(&self, offset: u64) -> Result<u64> {
        let info = self.object(offset, true)?;
        match info.header {
            HeaderType::None => Ok(0),
            header => self.mem.read_u64(offset - header.size() + 8),
        }
    }

    /// Usable bytes of the published object at `offset`
    pub fn usable_size(&self, offset: u64) -> Result<u64> {
        Ok(self.object(offset, false)?.usable)
    }

    /// Schedule a free; the same object cannot be scheduled twice
    pub fn mark_pending_free(&self, offset: u64) -> Result<()> {
        if !self.pending_free.lock().insert(offset) {
            return Err(Error::InvalidArgument(format!(
                "object at {:#x} is already scheduled for free",
                offset
            )));
        }
        Ok(())
    }

    /// Forget a scheduled free
    pub fn clear_pending_free(&self, offset: u64) {
        self.pending_free.lock().remove(&offset);
    }

    /// First published object after `after` in offset order (`None` = from the start)
    pub fn next_object(&self, after: Option<u64>) -> Option<u64> {
        let _gate = self.gate.write();
        let mut cursor: ChunkId = match after.and_then(chunk_containing) {
            Some(chunk) => {
                let map = self.chunks.lock();
                map.spans.range(..=chunk).next_back().map_or(chunk, |(start, _)| *start)
            }
            None => 0,
        };
        let beyond = |off: u64| after.map_or(true, |a| off > a);
        loop {
            let (start, span) = {
                let map = self.chunks.lock();
                let (start, span) = map.spans.range(cursor..).next()?;
                (*start, *span)
            };
            match span.kind {
                SpanKind::Huge { published: true } => {
                    let off = data_offset(start) + HUGE_HEADER.size();
                    if beyond(off) {
                        return Some(off);
                    }
                }
                SpanKind::Huge { published: false } => {}
                SpanKind::Run { class_id } => {
                    let bucket = self.buckets[class_id as usize].lock();
                    if let Some(run) = bucket.runs.get(&start) {
                        let found = run
                            .allocated_units()
                            .map(|u| run.user_offset(u))
                            .find(|off| beyond(*off));
                        if found.is_some() {
                            return found;
                        }
                    }
                }
            }
            cursor = start + 1;
        }
    }

    /// Bytes of growth after which a request of `size` could be served
    ///
    /// Assumes the request lands in the trailing free range of the last
    /// zone, or at the start of a new zone when it does not fit there.
    pub fn growth_needed(&self, size: u64, class: Option<u8>) -> Result<u64> {
        let wanted = match self.choose_class(size, class)? {
            Some(class) => class.run_chunks,
            None => huge_chunks(size)?,
        };
        let committed = self.mem.committed();
        let map = self.chunks.lock();
        let last = map.zone_chunks.len().saturating_sub(1) as u32;
        let registered = map.zone_chunks.last().copied().unwrap_or(0);
        let end = chunk_id(last, registered);
        let tail = map.free.range_ending_at(end).unwrap_or(end);
        let tail_index = if zone_of(tail) == last { tail % MAX_CHUNKS_PER_ZONE } else { registered };
        let needed_end = if tail_index + wanted <= MAX_CHUNKS_PER_ZONE {
            data_offset(chunk_id(last, tail_index)) + wanted as u64 * CHUNK_SIZE
        } else {
            data_offset(chunk_id(last + 1, 0)) + wanted as u64 * CHUNK_SIZE
        };
        Ok(needed_end.saturating_sub(committed))
    }

    /// Validate media against the volatile view
    ///
    /// Checks every zone magic, every chunk header against the span table
    /// and every run bitmap against its in-memory copy.
    pub fn check(&self) -> Result<()> {
        let _gate = self.gate.write();
        let runs: Vec<(ChunkId, u8)> = {
            let map = self.chunks.lock();
            for (zone, &count) in map.zone_chunks.iter().enumerate() {
                let zone = zone as u32;
                let magic = self.mem.read_u64(zone_offset(zone))?;
                if magic != ZONE_MAGIC {
                    return Err(Error::Corruption(format!("zone {} has bad magic {:#x}", zone, magic)));
                }
                for c in 0..count {
                    let id = chunk_id(zone, c);
                    let expected = map.spans.get(&id).map_or(0, Span::header_word);
                    let found = self.mem.read_u64(header_offset(id))?;
                    if found != expected {
                        return Err(Error::Corruption(format!(
                            "chunk {} header is {:#x}, expected {:#x}",
                            id, found, expected
                        )));
                    }
                }
            }
            map.spans
                .iter()
                .filter_map(|(start, span)| match span.kind {
                    SpanKind::Run { class_id } => Some((*start, class_id)),
                    SpanKind::Huge { .. } => None,
                })
                .collect()
        };
        for (start, class_id) in runs {
            let bucket = self.buckets[class_id as usize].lock();
            let run = bucket
                .runs
                .get(&start)
                .ok_or_else(|| Error::Corruption(format!("run at chunk {} is not loaded", start)))?;
            run.verify(self.mem.as_ref())?;
            let on_media = RunState::load(self.mem.as_ref(), start, run.run_chunks)?;
            if on_media.units != run.units || on_media.unit_size != run.unit_size {
                return Err(Error::Corruption(format!("run at chunk {} header changed", start)));
            }
        }
        Ok(())
    }

    /// Registered class `id`
    pub fn class(&self, id: u8) -> Option<AllocClass> {
        self.classes.read().get(id).copied()
    }

    /// Register a class under `id`, or under the first free id
    pub fn register_class(&self, id: Option<u8>, desc: AllocClassDesc) -> Result<AllocClass> {
        let mut classes = self.classes.write();
        let class = match id {
            Some(id) => classes.register(id, desc)?,
            None => classes.register_next(desc)?,
        };
        info!(target: "pmobj::heap", id = class.id, desc = %desc, units = class.units, "Allocation class registered");
        Ok(class)
    }

    /// Statistics counters
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Current statistics
    pub fn stats_snapshot(&self) -> HeapStatsSnapshot {
        self.stats.snapshot()
    }

    /// Free chunks in the index
    pub fn free_chunks(&self) -> u64 {
        self.chunks.lock().free.total()
    }

    /// The memory the heap lives in
    pub fn memory(&self) -> &Arc<dyn PersistentMemory> {
        &self.mem
    }
}

fn unit_reservation(run: &RunState, unit: u32) -> Reservation {
    Reservation {
        offset: run.user_offset(unit),
        usable: run.unit_size - run.header.size(),
        header: run.header,
        block: Block::Run {
            run: run.start,
            unit,
            class_id: run.class_id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmobj_core::layout::HEAP_OFFSET;
    use pmobj_core::limits::MIN_POOL;
    use pmobj_core::AnonMemory;
    use pmobj_durability::FailingMemory;

    const M: u64 = 1024 * 1024;

    fn heap_of(size: u64) -> (Arc<AnonMemory>, Heap) {
        let mem = Arc::new(AnonMemory::new(size));
        let heap = Heap::open(mem.clone(), true).unwrap();
        (mem, heap)
    }

    /// Apply entries the way a completed publish would
    fn publish(heap: &Heap, res: &Reservation) {
        let entry = heap.alloc_entry(res);
        let word = heap.memory().read_u64(entry.offset).unwrap();
        heap.memory().write_u64(entry.offset, entry.apply_to(word)).unwrap();
        heap.commit(&res.block);
    }

    fn free(heap: &Heap, off: u64) {
        let info = heap.object(off, false).unwrap();
        let entry = heap.free_entry(&info.block);
        let word = heap.memory().read_u64(entry.offset).unwrap();
        heap.memory().write_u64(entry.offset, entry.apply_to(word)).unwrap();
        heap.release(&info.block);
    }

    #[test]
    fn test_fresh_heap_is_all_free() {
        let (mem, heap) = heap_of(MIN_POOL);
        assert_eq!(mem.read_u64(HEAP_OFFSET).unwrap(), ZONE_MAGIC);
        assert_eq!(heap.free_chunks(), chunks_in_zone(0, MIN_POOL) as u64);
        assert_eq!(heap.next_object(None), None);
        heap.check().unwrap();
    }

    #[test]
    fn test_reserve_is_invisible_until_published() {
        let (_mem, heap) = heap_of(MIN_POOL);
        let res = heap.reserve(100, 7, None, false).unwrap();
        assert!(res.usable >= 100);
        assert_eq!(heap.next_object(None), None);
        assert!(heap.usable_size(res.offset).is_err());
        assert_eq!(heap.type_num(res.offset).unwrap(), 7);

        publish(&heap, &res);
        assert_eq!(heap.next_object(None), Some(res.offset));
        assert_eq!(heap.usable_size(res.offset).unwrap(), res.usable);
        heap.check().unwrap();
    }

    #[test]
    fn test_huge_reservation_and_cancel() {
        let (_mem, heap) = heap_of(MIN_POOL);
        let before = heap.free_chunks();
        let res = heap.reserve(2 * M, 0, None, true).unwrap();
        assert!(matches!(res.block, Block::Huge { len: 9, .. }));
        assert_eq!(heap.free_chunks(), before - 9);
        heap.cancel(&res.block);
        assert_eq!(heap.free_chunks(), before);
    }

    #[test]
    fn test_out_of_space() {
        let (_mem, heap) = heap_of(MIN_POOL);
        let err = heap.reserve(64 * M, 0, None, false).unwrap_err();
        assert!(err.is_out_of_space());
        assert!(heap.growth_needed(64 * M, None).unwrap() > 56 * M);
    }

    #[test]
    fn test_zero_size_rejected() {
        let (_mem, heap) = heap_of(MIN_POOL);
        assert!(matches!(heap.reserve(0, 0, None, false), Err(Error::InvalidArgument(_))));
        assert!(heap.reserve(10, 0, Some(99), false).is_err());
    }

    #[test]
    fn test_reopen_sees_published_and_reclaims_empty_runs() {
        let mem = Arc::new(AnonMemory::new(MIN_POOL));
        let kept;
        {
            let heap = Heap::open(mem.clone(), false).unwrap();
            let a = heap.reserve(64, 0, None, false).unwrap();
            let b = heap.reserve(3 * M, 0, None, false).unwrap();
            let c = heap.reserve(5000, 0, None, false).unwrap();
            publish(&heap, &a);
            publish(&heap, &b);
            // c's run is created on media but its unit never published
            kept = vec![a.offset, b.offset];
            let _ = c;
        }
        let heap = Heap::open(mem, false).unwrap();
        let mut seen = Vec::new();
        let mut cursor = None;
        while let Some(off) = heap.next_object(cursor) {
            seen.push(off);
            cursor = Some(off);
        }
        assert_eq!(seen, kept);
        heap.check().unwrap();
    }

    fn second_run(heap: &Heap, class: u8) -> (Vec<Reservation>, Reservation) {
        let desc: AllocClassDesc = "2M,0,4,none".parse().unwrap();
        heap.register_class(Some(class), desc).unwrap();
        let first: Vec<_> = (0..4)
            .map(|_| heap.reserve(2 * M, 0, Some(class), false).unwrap())
            .collect();
        let extra = heap.reserve(2 * M, 0, Some(class), false).unwrap();
        (first, extra)
    }

    fn run_of(block: &Block) -> ChunkId {
        match *block {
            Block::Run { run, .. } => run,
            Block::Huge { .. } => panic!("expected a run block"),
        }
    }

    #[test]
    fn test_reclaim_survives_header_flush_failure() {
        let anon = Arc::new(AnonMemory::new(10 * MIN_POOL));
        let mem = Arc::new(FailingMemory::new(anon.clone()));
        let heap = Heap::open(mem.clone(), false).unwrap();
        let before = heap.free_chunks();
        let (first, extra) = second_run(&heap, 128);
        let run = run_of(&extra.block);
        assert_ne!(run, run_of(&first[0].block));
        assert!(heap.free_chunks() < before);

        let at = header_offset(run);
        mem.fail_persist_in(at..at + 8);
        heap.cancel(&extra.block);
        mem.disarm();
        assert_eq!(anon.read_u64(at).unwrap(), 0);

        for res in &first {
            heap.cancel(&res.block);
        }
        assert_eq!(heap.free_chunks(), before - run_span(&heap, &first[0].block));
        heap.check().unwrap();

        let again = heap.reserve(2 * M, 0, Some(128), false).unwrap();
        publish(&heap, &again);
        heap.check().unwrap();
    }

    fn run_span(heap: &Heap, block: &Block) -> u64 {
        let (_, span) = heap.chunks.lock().span_at(run_of(block)).unwrap();
        span.len as u64
    }

    #[test]
    fn test_cancel_reclaim_is_hidden_from_enumeration() {
        let (_mem, heap) = heap_of(10 * MIN_POOL);
        let heap = Arc::new(heap);
        let kept = heap.reserve(64, 0, None, false).unwrap();
        publish(&heap, &kept);
        let desc: AllocClassDesc = "2M,0,4,none".parse().unwrap();
        heap.register_class(Some(128), desc).unwrap();
        let first: Vec<_> = (0..4)
            .map(|_| heap.reserve(2 * M, 0, Some(128), false).unwrap())
            .collect();

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let walker = {
            let heap = heap.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(std::sync::atomic::Ordering::Acquire) {
                    assert_eq!(heap.next_object(None), Some(kept.offset));
                    heap.check().unwrap();
                }
            })
        };
        for _ in 0..200 {
            let extra = heap.reserve(2 * M, 0, Some(128), false).unwrap();
            heap.cancel(&extra.block);
        }
        done.store(true, std::sync::atomic::Ordering::Release);
        walker.join().unwrap();

        for res in &first {
            heap.cancel(&res.block);
        }
        heap.check().unwrap();
    }

    #[test]
    fn test_free_returns_space() {
        let (_mem, heap) = heap_of(MIN_POOL);
        let before = heap.free_chunks();
        let res = heap.reserve(M, 0, None, false).unwrap();
        publish(&heap, &res);
        free(&heap, res.offset);
        assert_eq!(heap.free_chunks(), before);
        assert_eq!(heap.next_object(None), None);
        heap.check().unwrap();
    }

    #[test]
    fn test_custom_class_serves_reservations() {
        let (_mem, heap) = heap_of(10 * MIN_POOL);
        let desc: AllocClassDesc = "2M,0,4,none".parse().unwrap();
        heap.register_class(Some(128), desc).unwrap();
        let mut offsets = Vec::new();
        for _ in 0..4 {
            let res = heap.reserve(2 * M, 0, Some(128), false).unwrap();
            assert_eq!(res.usable, 2 * M);
            publish(&heap, &res);
            offsets.push(res.offset);
        }
        assert_eq!(heap.type_num(offsets[0]).unwrap(), 0);
        assert_eq!(heap.usable_size(offsets[3]).unwrap(), 2 * M);
        assert!(heap.reserve(2 * M + 1, 0, Some(128), false).is_err());
        heap.check().unwrap();
    }

    #[test]
    fn test_stats_follow_publish_and_free() {
        let (_mem, heap) = heap_of(MIN_POOL);
        let res = heap.reserve(100, 0, None, false).unwrap();
        let unit = match res.block {
            Block::Run { class_id, .. } => heap.class(class_id).unwrap().desc.unit_size,
            Block::Huge { .. } => unreachable!(),
        };
        assert_eq!(heap.stats_snapshot().curr_allocated, 0);
        assert!(heap.stats_snapshot().run_active >= CHUNK_SIZE);
        publish(&heap, &res);
        assert_eq!(heap.stats_snapshot().run_allocated, unit);
        free(&heap, res.offset);
        assert_eq!(heap.stats_snapshot().curr_allocated, 0);
    }

    #[test]
    fn test_extend_registers_new_chunks() {
        let mem = Arc::new(AnonMemory::with_capacity(MIN_POOL, 3 * MIN_POOL));
        let heap = Heap::open(mem.clone(), false).unwrap();
        let before = heap.free_chunks();
        assert!(heap.reserve(12 * M, 0, None, false).is_err());
        let needed = heap.growth_needed(12 * M, None).unwrap();
        mem.grow_to(MIN_POOL + needed);
        assert!(heap.extend().unwrap() > 0);
        assert!(heap.free_chunks() > before);
        heap.reserve(12 * M, 0, None, false).unwrap();
    }

    #[test]
    fn test_check_detects_corrupt_header() {
        let (mem, heap) = heap_of(MIN_POOL);
        mem.write_u64(header_offset(chunk_id(0, 3)), ChunkHeader::used(2).encode())
            .unwrap();
        assert!(matches!(heap.check(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_pending_free_rejects_duplicates() {
        let (_mem, heap) = heap_of(MIN_POOL);
        heap.mark_pending_free(4096).unwrap();
        assert!(heap.mark_pending_free(4096).is_err());
        heap.clear_pending_free(4096);
        heap.mark_pending_free(4096).unwrap();
    }

    #[test]
    fn test_merge_entries() {
        let merged = merge_entries(vec![
            RedoEntry::or(64, 1),
            RedoEntry::set(8, 5),
            RedoEntry::or(64, 4),
            RedoEntry::and(64, !2),
        ]);
        assert_eq!(merged, vec![RedoEntry::or(64, 5), RedoEntry::set(8, 5), RedoEntry::and(64, !2)]);
    }
}
