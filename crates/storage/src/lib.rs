//! Backing store for pmobj pools
//!
//! This crate maps a pool's backing files into memory:
//! - poolset: pool-set descriptor model, parser and validation
//! - format: pool header (primary + backup) and per-part headers
//! - mapping: replica address-space reservation, part mapping, mirrored
//!   persist and growth by whole parts
//!
//! Everything above this crate sees the pool as one flat
//! [`PersistentMemory`](pmobj_core::PersistentMemory) whose base never moves.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod mapping;
pub mod poolset;

pub use format::{PartHeader, PoolHeader};
pub use mapping::{MapOptions, PoolKind, PoolMapping, RegionHandle};
pub use poolset::{parse_size, PartDesc, PartKind, PoolSetDescriptor, ReplicaDesc};
