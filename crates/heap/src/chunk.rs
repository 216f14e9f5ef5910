//! Chunk headers and chunk addressing
//!
//! Every chunk has an 8-byte header in its zone's table:
//!
//! ```text
//! | kind u16 | flags u16 | size_idx u32 |
//! ```
//!
//! Only the first chunk of a span carries a non-zero header; the headers of
//! the chunks it covers stay zero. A zero header is a free chunk.

use pmobj_core::layout::{chunk_header_offset, chunk_offset, zone_offset, MAX_CHUNKS_PER_ZONE, ZONE_META_SIZE, ZONE_SIZE, CHUNK_SIZE, HEAP_OFFSET};

/// Magic word at the start of an initialised zone
pub const ZONE_MAGIC: u64 = u64::from_le_bytes(*b"PMOBJZN\0");

/// What a chunk span holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Not in use
    Free,
    /// One huge object spanning `size_idx` chunks
    Used,
    /// A run of small units spanning `size_idx` chunks
    Run,
}

/// Decoded chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Span kind
    pub kind: ChunkKind,
    /// Reserved flags
    pub flags: u16,
    /// Chunks in the span
    pub size_idx: u32,
}

impl ChunkHeader {
    /// Header of a huge object of `size_idx` chunks
    pub fn used(size_idx: u32) -> Self {
        ChunkHeader {
            kind: ChunkKind::Used,
            flags: 0,
            size_idx,
        }
    }

    /// Header of a run of `size_idx` chunks
    pub fn run(size_idx: u32) -> Self {
        ChunkHeader {
            kind: ChunkKind::Run,
            flags: 0,
            size_idx,
        }
    }

    /// Packed form
    pub fn encode(&self) -> u64 {
        let kind: u64 = match self.kind {
            ChunkKind::Free => 0,
            ChunkKind::Used => 1,
            ChunkKind::Run => 2,
        };
        kind | (self.flags as u64) << 16 | (self.size_idx as u64) << 32
    }

    /// Unpack; `None` for an unknown kind
    pub fn decode(word: u64) -> Option<Self> {
        let kind = match word & 0xffff {
            0 => ChunkKind::Free,
            1 => ChunkKind::Used,
            2 => ChunkKind::Run,
            _ => return None,
        };
        Some(ChunkHeader {
            kind,
            flags: ((word >> 16) & 0xffff) as u16,
            size_idx: (word >> 32) as u32,
        })
    }
}

/// Heap-wide chunk number: `zone * MAX_CHUNKS_PER_ZONE + chunk`
pub type ChunkId = u32;

/// Zone of a chunk
pub fn zone_of(id: ChunkId) -> u32 {
    id / MAX_CHUNKS_PER_ZONE
}

/// Chunk id from zone and in-zone index
pub fn chunk_id(zone: u32, chunk: u32) -> ChunkId {
    zone * MAX_CHUNKS_PER_ZONE + chunk
}

/// Logical offset of a chunk's data
pub fn data_offset(id: ChunkId) -> u64 {
    chunk_offset(zone_of(id), id % MAX_CHUNKS_PER_ZONE)
}

/// Logical offset of a chunk's header
pub fn header_offset(id: ChunkId) -> u64 {
    chunk_header_offset(zone_of(id), id % MAX_CHUNKS_PER_ZONE)
}

/// Chunk whose data contains `offset`, if any
pub fn chunk_containing(offset: u64) -> Option<ChunkId> {
    if offset < HEAP_OFFSET {
        return None;
    }
    let zone = ((offset - HEAP_OFFSET) / ZONE_SIZE) as u32;
    let rel = offset - zone_offset(zone);
    if rel < ZONE_META_SIZE {
        return None;
    }
    Some(chunk_id(zone, ((rel - ZONE_META_SIZE) / CHUNK_SIZE) as u32))
}
