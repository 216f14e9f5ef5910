//! Pool growth integration tests
//!
//! Directory-backed pools start with one minimum-size part per replica and
//! add parts as the heap runs out of space, within the reservation.

#[path = "../common/mod.rs"]
mod common;

mod growth;
mod manual;
mod replicas;
