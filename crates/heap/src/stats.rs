//! Heap statistics
//!
//! Counters move only while statistics are enabled. Enabling them part way
//! through a pool's life counts from zero, so decrements saturate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Live heap counters
#[derive(Debug, Default)]
pub struct HeapStats {
    enabled: AtomicBool,
    curr_allocated: AtomicU64,
    run_allocated: AtomicU64,
    run_active: AtomicU64,
}

/// Point-in-time copy of [`HeapStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatsSnapshot {
    /// Bytes held by published objects (unit or chunk granular)
    pub curr_allocated: u64,
    /// Bytes held by published objects in runs
    pub run_allocated: u64,
    /// Bytes of chunks currently formatted as runs
    pub run_active: u64,
}

impl HeapStats {
    /// Disabled, zeroed counters
    pub fn new(enabled: bool) -> Self {
        let stats = HeapStats::default();
        stats.set_enabled(enabled);
        stats
    }

    /// Turn counting on or off
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether counting is on
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn allocated(&self, bytes: u64, in_run: bool) {
        if !self.is_enabled() {
            return;
        }
        self.curr_allocated.fetch_add(bytes, Ordering::Relaxed);
        if in_run {
            self.run_allocated.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) fn freed(&self, bytes: u64, in_run: bool) {
        if !self.is_enabled() {
            return;
        }
        saturating_sub(&self.curr_allocated, bytes);
        if in_run {
            saturating_sub(&self.run_allocated, bytes);
        }
    }

    pub(crate) fn run_created(&self, bytes: u64) {
        if self.is_enabled() {
            self.run_active.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) fn run_reclaimed(&self, bytes: u64) {
        if self.is_enabled() {
            saturating_sub(&self.run_active, bytes);
        }
    }

    /// Current values
    pub fn snapshot(&self) -> HeapStatsSnapshot {
        HeapStatsSnapshot {
            curr_allocated: self.curr_allocated.load(Ordering::Relaxed),
            run_allocated: self.run_allocated.load(Ordering::Relaxed),
            run_active: self.run_active.load(Ordering::Relaxed),
        }
    }
}

fn saturating_sub(counter: &AtomicU64, bytes: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(bytes))
    });
}
