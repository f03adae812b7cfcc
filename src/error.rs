//! Error type shared by every fallible operation in the crate.

use thiserror::Error;

/// Result alias used throughout rtkit.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the registry, thread-local slots, caching map and
/// tracked allocator.
///
/// Every variant is handed back to the immediate caller; nothing here is
/// fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// All instance ids of a registry are in use.
    #[error("instance ids exhausted (capacity {capacity})")]
    Exhausted { capacity: usize },

    /// The underlying memory request failed.
    #[error("failed to allocate {size} bytes")]
    AllocationFailure { size: usize },

    /// A required input was null or out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The key is already present in the map.
    #[error("key already present")]
    AlreadyPresent,

    /// The thread-local slot has been torn down or moved out of.
    #[error("thread-local slot destroyed")]
    Destroyed,

    /// An enumeration callback asked to stop.
    #[error("callback failed")]
    CallFailed,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The process-wide registry was already created.
    #[error("runtime already initialized")]
    AlreadyInitialized,
}
