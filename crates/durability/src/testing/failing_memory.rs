//! Fault injection for persist
//!
//! [`FailingMemory`] forwards to another [`PersistentMemory`] but fails any
//! persist that touches an armed range, the way a flush to dying media would.
//! Stores still land; only the flush reports an error.

use std::io;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use pmobj_core::{Error, PersistentMemory, Result};

/// Memory whose flushes can be made to fail over a chosen range
pub struct FailingMemory {
    inner: Arc<dyn PersistentMemory>,
    armed: Mutex<Option<Range<u64>>>,
}

impl FailingMemory {
    /// Wrap `inner`; nothing fails until armed
    pub fn new(inner: Arc<dyn PersistentMemory>) -> Self {
        FailingMemory {
            inner,
            armed: Mutex::new(None),
        }
    }

    /// Fail every later persist that overlaps `range`
    pub fn fail_persist_in(&self, range: Range<u64>) {
        *self.armed.lock() = Some(range);
    }

    /// Stop failing
    pub fn disarm(&self) {
        *self.armed.lock() = None;
    }
}

impl PersistentMemory for FailingMemory {
    fn base(&self) -> *mut u8 {
        self.inner.base()
    }

    fn committed(&self) -> u64 {
        self.inner.committed()
    }

    fn persist(&self, offset: u64, len: u64) -> Result<()> {
        if let Some(range) = self.armed.lock().as_ref() {
            if offset < range.end && range.start < offset + len {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected flush failure at {offset:#x}"),
                )));
            }
        }
        self.inner.persist(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmobj_core::AnonMemory;

    #[test]
    fn test_fails_only_overlapping_ranges() {
        let mem = FailingMemory::new(Arc::new(AnonMemory::new(8192)));
        mem.fail_persist_in(4096..4104);
        assert!(mem.persist(0, 4096).is_ok());
        assert!(mem.persist(4104, 8).is_ok());
        assert!(matches!(mem.persist(4000, 100), Err(Error::Io(_))));

        // The store itself still lands.
        assert!(mem.write_persist(4096, &[7]).is_err());
        let mut byte = [0u8];
        mem.read(4096, &mut byte).unwrap();
        assert_eq!(byte, [7]);

        mem.disarm();
        assert!(mem.persist(4096, 8).is_ok());
    }
}
