//! Crash recovery integration tests
//!
//! A publish is cut short at each crash point and the pool reopened; the
//! batch must be either fully visible or not visible at all.

#[path = "../common/mod.rs"]
mod common;

mod crash_points;
