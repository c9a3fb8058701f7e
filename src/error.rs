//! Error types for shmcache
//!
//! Provides a unified error type for all operations. "Not found" is never an
//! error: lookups report absence through `Option`/`bool`.

use thiserror::Error;

/// Result type alias using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

/// Unified error type for shmcache operations
#[derive(Debug, Error)]
pub enum CacheError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Argument Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Allocation Errors
    // -------------------------------------------------------------------------
    #[error("Out of space: {needed} blocks needed, segment holds {capacity}")]
    OutOfSpace { needed: u32, capacity: u32 },

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Segment corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Lock not acquired after {waited_ms} ms (held by pid {holder})")]
    LockTimeout { holder: u32, waited_ms: u64 },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Codec error: {0}")]
    Codec(String),
}

impl CacheError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::LockTimeout { .. })
    }

    /// Whether the handle that produced this error is no longer usable
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::Corruption(_))
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        CacheError::Corruption(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CacheError::InvalidArgument(msg.into())
    }
}
