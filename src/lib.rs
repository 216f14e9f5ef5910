//! pmobj - transactional persistent-memory object pool
//!
//! A pool maps one file or a pool set of parts into a flat address space
//! and serves objects out of it. Allocation is split in two: `reserve`
//! claims space invisibly, `publish` makes any number of reservations and
//! deferred frees visible in one crash-atomic step.
//!
//! # Quick Start
//!
//! ```ignore
//! use pmobj::{Pool, PoolOptions};
//!
//! let pool = Pool::create("/mnt/pmem/pool.set", "inbox", 0)?;
//!
//! let mut batch = Vec::new();
//! for message in [&b"first"[..], &b"second"[..]] {
//!     let action = pool.reserve(message.len() as u64)?;
//!     pool.write(action.object_id(), 0, message)?;
//!     batch.push(action);
//! }
//! pool.publish(&mut batch)?;
//!
//! for id in pool.objects() {
//!     println!("{} holds {} bytes", id, pool.usable_size(id)?);
//! }
//! ```
//!
//! # Architecture
//!
//! - `pmobj-storage` maps parts, mirrors replicas and grows directory pools
//! - `pmobj-durability` publishes metadata updates through a redo log
//! - `pmobj-heap` lays objects out in zones, chunks and runs
//! - `pmobj-engine` ties them together behind [`Pool`]

pub use pmobj_core::limits;
pub use pmobj_core::{errormsg, Error, ObjectId, Result};
pub use pmobj_durability::{CrashPoint, DataState};
pub use pmobj_engine::*;
pub use pmobj_heap::{AllocClassDesc, HeaderType, HeapStatsSnapshot};
pub use pmobj_storage::{PartDesc, PoolKind, PoolSetDescriptor, ReplicaDesc};
