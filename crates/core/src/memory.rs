//! Byte-addressable persistent memory seam
//!
//! The heap and the action log only ever see a flat logical address space
//! through [`PersistentMemory`]. The storage crate implements it over
//! mapped part files; [`AnonMemory`] implements it over process memory
//! for unit tests.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Flat, flushable logical address space
///
/// Thread safety: implementations must allow concurrent access to disjoint
/// ranges. Word-sized metadata is accessed through [`atomic_u64`].
///
/// [`atomic_u64`]: PersistentMemory::atomic_u64
pub trait PersistentMemory: Send + Sync {
    /// Base address of the address space. Never moves while `self` lives.
    fn base(&self) -> *mut u8;

    /// Bytes currently backed by storage, starting at the base
    fn committed(&self) -> u64;

    /// Make `[offset, offset + len)` durable
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the committed space or the
    /// flush fails.
    fn persist(&self, offset: u64, len: u64) -> Result<()>;

    /// Fails unless `[offset, offset + len)` lies in committed space
    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.committed() => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "range {:#x}+{} is outside the committed {} bytes",
                offset,
                len,
                self.committed()
            ))),
        }
    }

    /// Copy bytes at `offset` into `buf`
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        // SAFETY: range checked against committed space, which stays mapped
        // for the lifetime of self.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base().add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy `data` to `offset` (not yet durable)
    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        // SAFETY: see read.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Set `len` bytes at `offset` to `byte` (not yet durable)
    fn fill(&self, offset: u64, len: u64, byte: u8) -> Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: see read.
        unsafe {
            std::ptr::write_bytes(self.base().add(offset as usize), byte, len as usize);
        }
        Ok(())
    }

    /// Write then persist
    fn write_persist(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.write(offset, data)?;
        self.persist(offset, data.len() as u64)
    }

    /// Atomic view of the 8-byte word at `offset`
    fn atomic_u64(&self, offset: u64) -> Result<&AtomicU64> {
        if offset % 8 != 0 {
            return Err(Error::InvalidArgument(format!(
                "metadata word at {:#x} is not 8-byte aligned",
                offset
            )));
        }
        self.check_range(offset, 8)?;
        // SAFETY: aligned, in committed space, and the base never moves while
        // self lives, so the reference cannot outlive the mapping.
        Ok(unsafe { &*(self.base().add(offset as usize) as *const AtomicU64) })
    }

    /// Load the word at `offset`
    fn read_u64(&self, offset: u64) -> Result<u64> {
        Ok(self.atomic_u64(offset)?.load(Ordering::Acquire))
    }

    /// Store the word at `offset` (not yet durable)
    fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.atomic_u64(offset)?.store(value, Ordering::Release);
        Ok(())
    }
}

/// Process-memory implementation of [`PersistentMemory`]
///
/// Holds a fixed-capacity, zeroed, 8-byte aligned buffer of which only the
/// first `committed` bytes are addressable. `persist` only counts calls.
/// Used to exercise the heap and the action log without files.
pub struct AnonMemory {
    words: NonNull<u64>,
    len_words: usize,
    committed: AtomicU64,
    persists: AtomicU64,
}

// SAFETY: the buffer is exclusively owned and never reallocated; concurrent
// access to disjoint ranges is the trait's contract.
unsafe impl Send for AnonMemory {}
unsafe impl Sync for AnonMemory {}

impl AnonMemory {
    /// Buffer of `size` bytes, all committed
    pub fn new(size: u64) -> Self {
        Self::with_capacity(size, size)
    }

    /// Buffer of `capacity` bytes with the first `committed` addressable
    pub fn with_capacity(committed: u64, capacity: u64) -> Self {
        let len_words = ((capacity + 7) / 8) as usize;
        let buf = vec![0u64; len_words].into_boxed_slice();
        let ptr = Box::into_raw(buf) as *mut u64;
        AnonMemory {
            // SAFETY: Box::into_raw never returns null.
            words: unsafe { NonNull::new_unchecked(ptr) },
            len_words,
            committed: AtomicU64::new(committed.min(capacity)),
            persists: AtomicU64::new(0),
        }
    }

    /// Extend the addressable range up to the capacity
    pub fn grow_to(&self, committed: u64) {
        let cap = self.len_words as u64 * 8;
        self.committed.store(committed.min(cap), Ordering::Release);
    }

    /// Number of persist calls so far
    pub fn persist_count(&self) -> u64 {
        self.persists.load(Ordering::Relaxed)
    }
}

impl Drop for AnonMemory {
    fn drop(&mut self) {
        // SAFETY: reconstructs the boxed slice leaked in with_capacity.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.words.as_ptr(),
                self.len_words,
            )));
        }
    }
}

impl PersistentMemory for AnonMemory {
    fn base(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    fn persist(&self, offset: u64, len: u64) -> Result<()> {
        self.check_range(offset, len)?;
        self.persists.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
