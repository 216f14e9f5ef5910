//! Durability layer for pmobj
//!
//! This crate implements crash-safe publication of heap metadata updates:
//! - log: redo entries, lanes, the per-lane commit word, replay on open
//! - testing: crash injection points for publish and flush fault injection
//!
//! The log knows nothing about the heap. Callers hand it a batch of word
//! updates and a payload flush, and it guarantees the batch is applied
//! completely or not at all across crashes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod log;
pub mod testing;

pub use log::{ActionLog, PublishOutcome, RecoveryStats, RedoEntry, RedoOp, RedoRecordError};
pub use testing::{CrashPoint, DataState, FailingMemory};
