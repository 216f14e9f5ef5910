//! Pool engine for pmobj
//!
//! This crate orchestrates the lower layers:
//! - Pool: create/open/close, reserve/publish/cancel, object access
//! - Action: pending reservations and deferred frees (cancel on drop)
//! - ExtensionController: automatic and manual pool growth
//! - ctl: runtime control keys
//! - config: PoolOptions and environment configuration
//!
//! The engine is the only component that knows about:
//! - the order of log replay and heap load at open
//! - which heap updates make up one published batch
//! - when the mapping grows

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod config;
pub mod ctl;
pub mod extend;
pub mod pool;

pub use action::{Action, ActionKind, AllocFlags};
pub use config::{PoolOptions, CONF_ENV, CONF_FILE_ENV};
pub use ctl::CtlValue;
pub use extend::ExtensionController;
pub use pool::Pool;
