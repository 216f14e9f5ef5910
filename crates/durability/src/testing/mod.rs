//! Testing utilities for the action log
//!
//! - **Crash Points**: where a publish can be cut short to simulate process
//!   death, and what recovery must make of it
//! - **Failing Memory**: a [`PersistentMemory`](pmobj_core::PersistentMemory)
//!   wrapper whose flushes fail on demand
//!
//! # Example
//!
//! ```ignore
//! use pmobj_durability::testing::{CrashPoint, DataState};
//!
//! for point in CrashPoint::all() {
//!     assert_eq!(point.expected_data_state() == DataState::Present, point.is_committed());
//! }
//! ```

mod crash_harness;
mod failing_memory;

pub use crash_harness::{CrashPoint, DataState};
pub use failing_memory::FailingMemory;
