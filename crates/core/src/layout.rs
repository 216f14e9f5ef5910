//! On-media geometry of a pool
//!
//! ```text
//! +---------------------+ 0
//! | Pool header         | 4 KiB (primary copy + backup copy)
//! +---------------------+ 4096
//! | Lane 0 .. Lane 7    | 8 x 16 KiB redo-log lanes
//! +---------------------+ HEAP_OFFSET
//! | Zone 0              | zone header + chunk header table (32 KiB)
//! |                     | up to 4088 chunks of 256 KiB
//! +---------------------+
//! | Zone 1 ...          |
//! +---------------------+
//! ```
//!
//! Every offset here is logical: relative to the start of the pool's
//! flat address space, independent of how parts are laid out on disk.

/// Size of the pool header region
pub const POOL_HEADER_SIZE: u64 = 4096;

/// Number of redo-log lanes
pub const LANE_COUNT: usize = 8;

/// Size of one lane
pub const LANE_SIZE: u64 = 16 * 1024;

/// Offset of lane 0
pub const LANES_OFFSET: u64 = POOL_HEADER_SIZE;

/// Offset of the first redo entry inside a lane (after the commit word)
pub const LANE_ENTRIES_OFFSET: u64 = 64;

/// Size of one redo entry
pub const REDO_ENTRY_SIZE: u64 = 16;

/// Redo entries one lane holds
pub const LANE_CAPACITY: usize = ((LANE_SIZE - LANE_ENTRIES_OFFSET) / REDO_ENTRY_SIZE) as usize;

/// Start of the heap (zone 0)
pub const HEAP_OFFSET: u64 = LANES_OFFSET + LANE_COUNT as u64 * LANE_SIZE;

/// Allocation granule of the heap
pub const CHUNK_SIZE: u64 = 256 * 1024;

/// Size of the zone header preceding the chunk header table
pub const ZONE_HEADER_SIZE: u64 = 64;

/// Size of one chunk header
pub const CHUNK_HEADER_SIZE: u64 = 8;

/// Chunks per zone
pub const MAX_CHUNKS_PER_ZONE: u32 = 4088;

/// Zone header plus chunk header table
pub const ZONE_META_SIZE: u64 = ZONE_HEADER_SIZE + MAX_CHUNKS_PER_ZONE as u64 * CHUNK_HEADER_SIZE;

/// Full size of one zone
pub const ZONE_SIZE: u64 = ZONE_META_SIZE + MAX_CHUNKS_PER_ZONE as u64 * CHUNK_SIZE;

/// Offset of zone `zone`
pub const fn zone_offset(zone: u32) -> u64 {
    HEAP_OFFSET + zone as u64 * ZONE_SIZE
}

/// Offset of the chunk header for `chunk` in `zone`
pub const fn chunk_header_offset(zone: u32, chunk: u32) -> u64 {
    zone_offset(zone) + ZONE_HEADER_SIZE + chunk as u64 * CHUNK_HEADER_SIZE
}

/// Offset of the data of `chunk` in `zone`
pub const fn chunk_offset(zone: u32, chunk: u32) -> u64 {
    zone_offset(zone) + ZONE_META_SIZE + chunk as u64 * CHUNK_SIZE
}

/// Number of whole chunks usable in `zone` when the pool is `committed` bytes long
pub fn chunks_in_zone(zone: u32, committed: u64) -> u32 {
    let data = zone_offset(zone) + ZONE_META_SIZE;
    if committed <= data {
        return 0;
    }
    ((committed - data) / CHUNK_SIZE).min(MAX_CHUNKS_PER_ZONE as u64) as u32
}

/// Number of zones that hold at least one chunk for a pool of `committed` bytes
pub fn zone_count(committed: u64) -> u32 {
    let mut zones = 0;
    while chunks_in_zone(zones, committed) > 0 {
        zones += 1;
    }
    zones
}
