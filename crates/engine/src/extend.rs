//! Pool extension
//!
//! Grows directory-backed pools when the heap runs out of space. One thread
//! grows at a time; the others wait on the growth lock and retry, so a
//! burst of failing reservations causes a single growth.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use pmobj_core::limits::MIN_PART;
use pmobj_core::{Error, PersistentMemory, Result};
use pmobj_heap::Heap;
use pmobj_storage::PoolMapping;
use tracing::{info, warn};

/// Growth policy and the lock serialising growth
#[derive(Debug)]
pub struct ExtensionController {
    granularity: AtomicU64,
    grow: Mutex<()>,
}

impl ExtensionController {
    /// Controller with the given granularity
    ///
    /// # Errors
    ///
    /// `InvalidGranularity` unless `granularity` is 0 or at least `MIN_PART`.
    pub fn new(granularity: u64) -> Result<Self> {
        check_granularity(granularity)?;
        Ok(ExtensionController {
            granularity: AtomicU64::new(granularity),
            grow: Mutex::new(()),
        })
    }

    /// Current growth step (0 = no automatic growth)
    pub fn granularity(&self) -> u64 {
        self.granularity.load(Ordering::Acquire)
    }

    /// Change the growth step; an invalid value keeps the previous one
    pub fn set_granularity(&self, granularity: u64) -> Result<()> {
        check_granularity(granularity)?;
        self.granularity.store(granularity, Ordering::Release);
        Ok(())
    }

    /// Run `attempt`, growing the pool once if it runs out of space
    ///
    /// `size` and `class` describe the request so the heap can tell how much
    /// growth would satisfy it. Growth adds parts of `granularity` bytes
    /// until at least `max(granularity, deficit)` was added or the
    /// reservation is exhausted.
    pub fn with_growth<T>(
        &self,
        mapping: &PoolMapping,
        heap: &Heap,
        size: u64,
        class: Option<u8>,
        attempt: impl Fn() -> Result<T>,
    ) -> Result<T> {
        let first = match attempt() {
            Err(e) if e.is_out_of_space() => e,
            other => return other,
        };
        let granularity = self.granularity();
        if granularity == 0 || !mapping.is_growable() {
            return Err(first);
        }

        let _grow = self.grow.lock();
        match attempt() {
            Err(e) if e.is_out_of_space() => {}
            other => return other,
        }

        let deficit = heap.growth_needed(size, class)?;
        let target = deficit.max(granularity);
        let mut added = 0u64;
        let mut failure = None;
        while added < target {
            match mapping.grow(granularity, false) {
                Ok(region) => added += region.len,
                Err(Error::OutOfAddressSpace { available, .. }) => {
                    warn!(
                        target: "pmobj::extend",
                        added,
                        wanted = target,
                        available,
                        "Reservation exhausted during growth"
                    );
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if added > 0 {
            heap.extend()?;
            info!(
                target: "pmobj::extend",
                added,
                deficit,
                committed = mapping.committed(),
                "Pool extended"
            );
        }
        if let Some(e) = failure {
            return Err(e);
        }
        attempt()
    }

    /// Grow by exactly `size` bytes
    ///
    /// # Errors
    ///
    /// - `InvalidGranularity` if `size` is below `MIN_PART`
    /// - `PoolNotExtensible` if the pool has no growth directories
    /// - `OutOfAddressSpace` if `size` does not fit
    pub fn extend(&self, mapping: &PoolMapping, heap: &Heap, size: u64) -> Result<u64> {
        if size < MIN_PART {
            return Err(Error::InvalidGranularity {
                value: size,
                minimum: MIN_PART,
            });
        }
        let _grow = self.grow.lock();
        let region = mapping.grow(size, true)?;
        heap.extend()?;
        info!(target: "pmobj::extend", size = region.len, part = region.part_index, "Pool extended on request");
        Ok(region.len)
    }
}

fn check_granularity(granularity: u64) -> Result<()> {
    if granularity != 0 && granularity < MIN_PART {
        return Err(Error::InvalidGranularity {
            value: granularity,
            minimum: MIN_PART,
        });
    }
    Ok(())
}
