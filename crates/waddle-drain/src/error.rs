//! Error type shared by the store, socket glue, and configuration layers.
//!
//! The selection hot path has no failure surface; these errors only come from
//! the boundaries around it (syscalls, configuration, external stores).

use thiserror::Error;

/// Errors produced by `waddle-drain` outside the selection hot path.
#[derive(Debug, Error)]
pub enum DrainError {
    /// A socket syscall failed.
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The operation is not available on this platform.
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    /// A drain store cannot hold zero entries.
    #[error("drain store capacity must be greater than zero (got {0})")]
    InvalidCapacity(usize),

    /// A configuration value could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidConfig { key: &'static str, value: String },

    /// An externally backed store could not be reached.
    #[error("drain store unavailable: {0}")]
    StoreUnavailable(String),
}
