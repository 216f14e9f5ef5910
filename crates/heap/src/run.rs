//! Runs: chunk spans carved into equal units of one class
//!
//! ```text
//! +---------------------+ run start (first chunk's data)
//! | Run header          | 64 bytes
//! | Allocation bitmap   | one bit per unit, set = allocated
//! +---------------------+ data_offset
//! | unit 0 | unit 1 |...|
//! +---------------------+
//! ```
//!
//! The on-media bitmap only ever changes through the action log. Reserved
//! units are tracked in memory only, so a crash forgets them.

use byteorder::{ByteOrder, LittleEndian};
use pmobj_core::layout::CHUNK_SIZE;
use pmobj_core::{Error, PersistentMemory, Result};

use crate::chunk::{data_offset, ChunkId};
use crate::class::{AllocClass, HeaderType};

/// Size of the run header
pub const RUN_HEADER_SIZE: u64 = 64;

const RUN_MAGIC: u32 = u32::from_le_bytes(*b"PRUN");

/// In-memory state of one run
#[derive(Debug, Clone)]
pub struct RunState {
    /// First chunk
    pub start: ChunkId,
    /// Chunks spanned
    pub run_chunks: u32,
    /// Class the run was created for
    pub class_id: u8,
    /// Object header of every unit
    pub header: HeaderType,
    /// Unit size
    pub unit_size: u64,
    /// Units in the run
    pub units: u32,
    /// Offset of unit 0 from the run start
    pub data_offset: u64,
    allocated: Vec<u64>,
    reserved: Vec<u64>,
    free: u32,
}

impl RunState {
    /// Fresh, empty run for `class` starting at `start`
    pub fn new(start: ChunkId, class: &AllocClass) -> Self {
        let words = (class.units as usize + 63) / 64;
        RunState {
            start,
            run_chunks: class.run_chunks,
            class_id: class.id,
            header: class.desc.header,
            unit_size: class.desc.unit_size,
            units: class.units,
            data_offset: class.data_offset,
            allocated: vec![0; words],
            reserved: vec![0; words],
            free: class.units,
        }
    }

    /// Write the run header and a clear bitmap, then persist them
    pub fn format(&self, mem: &dyn PersistentMemory) -> Result<()> {
        let mut buf = vec![0u8; (RUN_HEADER_SIZE as usize) + self.allocated.len() * 8];
        LittleEndian::write_u32(&mut buf[0..4], RUN_MAGIC);
        buf[4] = self.class_id;
        buf[5] = self.header.code();
        LittleEndian::write_u32(&mut buf[8..12], self.units);
        LittleEndian::write_u32(&mut buf[12..16], self.run_chunks);
        LittleEndian::write_u64(&mut buf[16..24], self.unit_size);
        LittleEndian::write_u64(&mut buf[24..32], self.data_offset);
        mem.write_persist(self.base(), &buf)
    }

    /// Load a run from media, validating its header against the chunk span
    pub fn load(mem: &dyn PersistentMemory, start: ChunkId, run_chunks: u32) -> Result<Self> {
        let base = data_offset(start);
        let mut hdr = [0u8; RUN_HEADER_SIZE as usize];
        mem.read(base, &mut hdr)?;
        let corrupt = |what: &str| Error::Corruption(format!("run at chunk {}: {}", start, what));

        if LittleEndian::read_u32(&hdr[0..4]) != RUN_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let header = HeaderType::from_code(hdr[5]).ok_or_else(|| corrupt("unknown header type"))?;
        let units = LittleEndian::read_u32(&hdr[8..12]);
        let stored_chunks = LittleEndian::read_u32(&hdr[12..16]);
        let unit_size = LittleEndian::read_u64(&hdr[16..24]);
        let data_off = LittleEndian::read_u64(&hdr[24..32]);
        let words = (units as usize + 63) / 64;
        let span = run_chunks as u64 * CHUNK_SIZE;
        if stored_chunks != run_chunks
            || units == 0
            || unit_size == 0
            || data_off < RUN_HEADER_SIZE + words as u64 * 8
            || data_off + units as u64 * unit_size > span
        {
            return Err(corrupt("geometry does not fit the chunk span"));
        }

        let mut allocated = vec![0u64; words];
        for (w, word) in allocated.iter_mut().enumerate() {
            *word = mem.read_u64(base + RUN_HEADER_SIZE + w as u64 * 8)?;
        }
        let used: u32 = allocated.iter().map(|w| w.count_ones()).sum();
        Ok(RunState {
            start,
            run_chunks,
            class_id: hdr[4],
            header,
            unit_size,
            units,
            data_offset: data_off,
            reserved: vec![0; words],
            allocated,
            free: units.saturating_sub(used),
        })
    }

    /// True if units of `class` can be served from this run
    pub fn matches(&self, class: &AllocClass) -> bool {
        self.class_id == class.id
            && self.unit_size == class.desc.unit_size
            && self.header == class.desc.header
            && self.units == class.units
            && self.data_offset == class.data_offset
    }

    /// Logical offset of the run start
    pub fn base(&self) -> u64 {
        data_offset(self.start)
    }

    /// Bytes spanned by the run
    pub fn span_bytes(&self) -> u64 {
        self.run_chunks as u64 * CHUNK_SIZE
    }

    /// Reserve the lowest free unit
    pub fn claim(&mut self) -> Option<u32> {
        if self.free == 0 {
            return None;
        }
        for (w, (a, r)) in self.allocated.iter().zip(&self.reserved).enumerate() {
            let taken = a | r;
            if taken == u64::MAX {
                continue;
            }
            let unit = w as u32 * 64 + (!taken).trailing_zeros();
            if unit >= self.units {
                return None;
            }
            self.reserved[w] |= mask(unit);
            self.free -= 1;
            return Some(unit);
        }
        None
    }

    /// Drop a reservation
    pub fn unreserve(&mut self, unit: u32) {
        let w = (unit / 64) as usize;
        if self.reserved[w] & mask(unit) != 0 {
            self.reserved[w] &= !mask(unit);
            self.free += 1;
        }
    }

    /// Reservation became a published allocation
    pub fn commit(&mut self, unit: u32) {
        let w = (unit / 64) as usize;
        self.reserved[w] &= !mask(unit);
        self.allocated[w] |= mask(unit);
    }

    /// Published allocation was freed
    pub fn release(&mut self, unit: u32) {
        let w = (unit / 64) as usize;
        if self.allocated[w] & mask(unit) != 0 {
            self.allocated[w] &= !mask(unit);
            self.free += 1;
        }
    }

    /// True if `unit` is a published allocation
    pub fn is_allocated(&self, unit: u32) -> bool {
        unit < self.units && self.allocated[(unit / 64) as usize] & mask(unit) != 0
    }

    /// True if `unit` is reserved but unpublished
    pub fn is_reserved(&self, unit: u32) -> bool {
        unit < self.units && self.reserved[(unit / 64) as usize] & mask(unit) != 0
    }

    /// No unit allocated or reserved
    pub fn is_empty(&self) -> bool {
        self.free == self.units
    }

    /// Published units, ascending
    pub fn allocated_units(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.units).filter(move |u| self.is_allocated(*u))
    }

    /// Offset of the first byte of `unit` (its header, if any)
    pub fn unit_offset(&self, unit: u32) -> u64 {
        self.base() + self.data_offset + unit as u64 * self.unit_size
    }

    /// Offset of the user data of `unit`
    pub fn user_offset(&self, unit: u32) -> u64 {
        self.unit_offset(unit) + self.header.size()
    }

    /// Unit whose user data starts exactly at `offset`
    pub fn unit_at(&self, offset: u64) -> Option<u32> {
        let first = self.user_offset(0);
        if offset < first || (offset - first) % self.unit_size != 0 {
            return None;
        }
        let unit = (offset - first) / self.unit_size;
        (unit < self.units as u64).then_some(unit as u32)
    }

    /// Offset of the bitmap word holding `unit`
    pub fn bitmap_word(&self, unit: u32) -> u64 {
        bitmap_word_offset(self.start, unit)
    }

    /// Compare the in-memory bitmap with media; bits past the last unit must be clear
    pub fn verify(&self, mem: &dyn PersistentMemory) -> Result<()> {
        for (w, expected) in self.allocated.iter().enumerate() {
            let on_media = mem.read_u64(self.base() + RUN_HEADER_SIZE + w as u64 * 8)?;
            if on_media != *expected {
                return Err(Error::Corruption(format!(
                    "run at chunk {}: bitmap word {} is {:#x}, expected {:#x}",
                    self.start, w, on_media, expected
                )));
            }
        }
        let tail_bits = self.units % 64;
        if tail_bits != 0 {
            let last = self.allocated[self.allocated.len() - 1];
            if last >> tail_bits != 0 {
                return Err(Error::Corruption(format!(
                    "run at chunk {}: bits set past unit {}",
                    self.start, self.units
                )));
            }
        }
        Ok(())
    }
}

/// Offset of the bitmap word holding `unit` of the run starting at `start`
pub fn bitmap_word_offset(start: ChunkId, unit: u32) -> u64 {
    data_offset(start) + RUN_HEADER_SIZE + (unit / 64) as u64 * 8
}

/// Bit of `unit` inside its bitmap word
pub fn mask(unit: u32) -> u64 {
    1u64 << (unit % 64)
}
