//! Reserve/publish integration tests
//!
//! Reservations stay invisible until published; a batch becomes visible
//! atomically and survives reopening the pool.

#[path = "../common/mod.rs"]
mod common;

mod basic;
mod classes;
mod concurrency;
