//! Core types shared by every pmobj crate
//!
//! This crate defines the foundational pieces the rest of the system builds on:
//! - ObjectId: persistent object identifier (pool UUID + offset)
//! - Error: error taxonomy and `Result` alias
//! - layout: on-media geometry (pool header, lanes, zones, chunks)
//! - limits: pool and part size limits
//! - PersistentMemory: byte-addressable, flushable memory seam
//! - errormsg: per-thread description of the last failure

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod errormsg;
pub mod layout;
pub mod limits;
pub mod memory;
pub mod types;

pub use error::{Error, Result};
pub use errormsg::{errormsg, record_error, set_errormsg};
pub use memory::{AnonMemory, PersistentMemory};
pub use types::ObjectId;
