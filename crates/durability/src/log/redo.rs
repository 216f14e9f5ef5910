//! Redo entry format
//!
//! ```text
//! | target offset | op | 8 bytes (u64 LE, op in the low 2 bits)
//! | value              | 8 bytes (u64 LE)
//! ```
//!
//! Targets are 8-byte aligned metadata words. Every op is idempotent, so
//! replaying an entry that was already applied changes nothing.

use byteorder::{ByteOrder, LittleEndian};
use pmobj_core::layout::REDO_ENTRY_SIZE;
use pmobj_core::Error;
use thiserror::Error as ThisError;

const OP_MASK: u64 = 0b11;

/// Operation applied to the target word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoOp {
    /// word = value
    Set,
    /// word |= value
    Or,
    /// word &= value
    And,
}

impl RedoOp {
    fn code(self) -> u64 {
        match self {
            RedoOp::Set => 0,
            RedoOp::Or => 1,
            RedoOp::And => 2,
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(RedoOp::Set),
            1 => Some(RedoOp::Or),
            2 => Some(RedoOp::And),
            _ => None,
        }
    }
}

/// One metadata update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoEntry {
    /// Logical offset of the target word
    pub offset: u64,
    /// Operation
    pub op: RedoOp,
    /// Operand
    pub value: u64,
}

/// Redo entry errors
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum RedoRecordError {
    /// Target is not 8-byte aligned
    #[error("target {0:#x} is not 8-byte aligned")]
    Unaligned(u64),

    /// Unknown op code
    #[error("unknown op code {0}")]
    UnknownOp(u64),

    /// Commit word checksum does not match the entries
    #[error("checksum mismatch: commit {expected:08x}, entries {computed:08x}")]
    ChecksumMismatch {
        /// CRC in the commit word
        expected: u32,
        /// CRC of the entries on media
        computed: u32,
    },

    /// Commit word counts more entries than a lane holds
    #[error("commit word counts {0} entries")]
    BadCount(u64),
}

impl From<RedoRecordError> for Error {
    fn from(e: RedoRecordError) -> Self {
        Error::Corruption(format!("redo log: {}", e))
    }
}

impl RedoEntry {
    /// word = value
    pub fn set(offset: u64, value: u64) -> Self {
        RedoEntry {
            offset,
            op: RedoOp::Set,
            value,
        }
    }

    /// word |= mask
    pub fn or(offset: u64, mask: u64) -> Self {
        RedoEntry {
            offset,
            op: RedoOp::Or,
            value: mask,
        }
    }

    /// word &= mask
    pub fn and(offset: u64, mask: u64) -> Self {
        RedoEntry {
            offset,
            op: RedoOp::And,
            value: mask,
        }
    }

    /// Encode into `buf` (16 bytes)
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), RedoRecordError> {
        if self.offset & 0b111 != 0 {
            return Err(RedoRecordError::Unaligned(self.offset));
        }
        LittleEndian::write_u64(&mut buf[0..8], self.offset | self.op.code());
        LittleEndian::write_u64(&mut buf[8..16], self.value);
        Ok(())
    }

    /// Decode from `buf` (16 bytes)
    pub fn decode(buf: &[u8]) -> Result<Self, RedoRecordError> {
        let word = LittleEndian::read_u64(&buf[0..8]);
        let op = RedoOp::from_code(word & OP_MASK)
            .ok_or(RedoRecordError::UnknownOp(word & OP_MASK))?;
        Ok(RedoEntry {
            offset: word & !0b111,
            op,
            value: LittleEndian::read_u64(&buf[8..16]),
        })
    }

    /// Result of applying this entry to `current`
    pub fn apply_to(&self, current: u64) -> u64 {
        match self.op {
            RedoOp::Set => self.value,
            RedoOp::Or => current | self.value,
            RedoOp::And => current & self.value,
        }
    }
}

/// Encode a batch of entries into one contiguous buffer
pub fn encode_entries(entries: &[RedoEntry]) -> Result<Vec<u8>, RedoRecordError> {
    let mut buf = vec![0u8; entries.len() * REDO_ENTRY_SIZE as usize];
    for (entry, chunk) in entries
        .iter()
        .zip(buf.chunks_exact_mut(REDO_ENTRY_SIZE as usize))
    {
        entry.encode(chunk)?;
    }
    Ok(buf)
}

/// Commit word for an encoded batch: CRC32 in the high half, count in the low half
pub fn commit_word(encoded: &[u8], count: usize) -> u64 {
    ((crc32fast::hash(encoded) as u64) << 32) | count as u64
}
