//! Size limits for pools and parts
//!
//! These are fixed by the on-media format and enforced at create, open
//! and growth time.

/// Smallest pool that can be created (8 MiB)
pub const MIN_POOL: u64 = 8 * 1024 * 1024;

/// Smallest part file, and smallest growth step (2 MiB)
pub const MIN_PART: u64 = 2 * 1024 * 1024;

/// Longest layout identifier in bytes
pub const MAX_LAYOUT: usize = 1024;

/// Default automatic growth granularity (128 MiB)
pub const DEFAULT_GRANULARITY: u64 = 128 * 1024 * 1024;

/// Alignment of part sizes and growth steps
pub const PART_ALIGN: u64 = 4096;

/// Rounds `size` down to [`PART_ALIGN`]
pub const fn align_down(size: u64) -> u64 {
    size & !(PART_ALIGN - 1)
}

/// Rounds `size` up to [`PART_ALIGN`]
pub const fn align_up(size: u64) -> u64 {
    (size + PART_ALIGN - 1) & !(PART_ALIGN - 1)
}
