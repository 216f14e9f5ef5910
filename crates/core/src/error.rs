//! Error types for pmobj
//!
//! Every public operation returns [`Result`]. Lower layers keep their own
//! narrow error enums and convert into [`Error`] at the crate boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pmobj operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for pool, heap and control operations
#[derive(Debug, Error)]
pub enum Error {
    /// Pool-set descriptor is malformed or inconsistent
    #[error("invalid pool set descriptor: {0}")]
    DescriptorInvalid(String),

    /// No free block satisfies the request and the pool could not grow
    #[error("out of space: no free block for {requested} bytes")]
    OutOfSpace {
        /// Requested allocation size
        requested: u64,
    },

    /// Growth would exceed the reserved address space of a replica
    #[error("out of address space: growth of {requested} bytes exceeds the {available} bytes left in the reservation")]
    OutOfAddressSpace {
        /// Bytes the growth asked for
        requested: u64,
        /// Bytes still reservable in the tightest replica
        available: u64,
    },

    /// Growth granularity or extension size is below the minimum part size
    #[error("invalid size {value}: must be 0 or at least the minimum part size of {minimum} bytes")]
    InvalidGranularity {
        /// Rejected value
        value: u64,
        /// Minimum part size
        minimum: u64,
    },

    /// Pool is not backed by growth directories
    #[error("pool is not extensible: {0}")]
    PoolNotExtensible(String),

    /// I/O error (file creation, mapping, flushing)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-media metadata failed validation
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Argument is out of range or refers to something that does not exist
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Control key is not recognised
    #[error("unknown control key: {0}")]
    UnknownCtlKey(String),

    /// Pool layout identifier does not match the one requested at open
    #[error("layout mismatch: expected {expected:?}, found {found:?}")]
    LayoutMismatch {
        /// Layout requested by the caller
        expected: String,
        /// Layout stored in the pool header
        found: String,
    },

    /// Pool files already exist at create
    #[error("pool already exists: {0}")]
    PoolExists(PathBuf),

    /// Another handle holds the pool lock
    #[error("pool is in use by another process: {0}")]
    PoolInUse(PathBuf),

    /// Published batch needs more metadata updates than one log lane holds
    #[error("batch too large: {entries} metadata updates exceed lane capacity of {capacity}")]
    BatchTooLarge {
        /// Metadata updates the batch needs
        entries: usize,
        /// Updates one lane can hold
        capacity: usize,
    },

    /// Batch is durable but applying it failed; the next open replays it
    #[error("batch committed but not applied: {0}")]
    CommittedNotApplied(String),

    /// A committed batch is waiting for replay; reopen the pool to publish again
    #[error("log lane {0} holds a batch awaiting replay; reopen the pool")]
    RecoveryRequired(usize),
}

impl Error {
    /// True if the failure was caused by exhausting free space or address space
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Error::OutOfSpace { .. } | Error::OutOfAddressSpace { .. })
    }
}
