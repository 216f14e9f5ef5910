//! On-media byte formats for pool and part headers.
//!
//! # Module Structure
//!
//! - `pool_header`: pool-wide header at logical offset 0 (primary + backup copy)
//! - `part_header`: per-part header written at the start of explicit part
//!   files when the pool does not use `SINGLEHDR`

pub mod part_header;
pub mod pool_header;

pub use part_header::{PartHeader, PART_HEADER_MAGIC, PART_HEADER_SIZE};
pub use pool_header::{
    read_pool_header, write_pool_header, HeaderError, PoolHeader, HEADER_COPY_SIZE,
    POOL_FORMAT_VERSION, POOL_HEADER_MAGIC,
};
