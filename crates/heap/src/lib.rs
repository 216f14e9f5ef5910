//! Persistent heap for pmobj
//!
//! This crate lays objects out inside the pool's heap region:
//! - chunk: zones, chunk headers and chunk addressing
//! - class: allocation classes and the class registry
//! - free_index: best-fit index of free chunk ranges
//! - run: runs of equal units with an on-media bitmap
//! - heap: reservation, publication hooks, enumeration and checks
//! - stats: optional allocation counters
//!
//! The heap never makes an allocation visible by itself. It reserves space
//! and hands out the redo entries that publish or free it; the durability
//! crate applies them atomically.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod class;
pub mod free_index;
pub mod heap;
pub mod run;
pub mod stats;

pub use class::{
    default_class_count, AllocClass, AllocClassDesc, AllocClassRegistry, HeaderType, HUGE_CLASS_ID,
    MAX_CLASS_ID,
};
pub use heap::{merge_entries, Block, Heap, ObjectInfo, Reservation, HUGE_HEADER};
pub use stats::{HeapStats, HeapStatsSnapshot};
