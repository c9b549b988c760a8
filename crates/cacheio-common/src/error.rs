//! Error types for CacheIO
//!
//! This module defines the common error types used throughout the engine.

use thiserror::Error;

/// Common result type for CacheIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for CacheIO
#[derive(Debug, Error)]
pub enum Error {
    // Request preparation errors
    #[error("mapping failed: {needed} lines needed, {available} free")]
    MappingFailed { needed: u32, available: u64 },

    #[error("no evictable lines available")]
    NoEvictableLines,

    #[error("cache line lock could not be acquired")]
    LockNotAcquired,

    #[error("request mapping is no longer valid")]
    InvalidMapping,

    #[error("partition {0} is disabled")]
    PartitionDisabled(u16),

    // Cleaning errors
    #[error("cleaning failed: {0}")]
    CleaningFailed(String),

    // I/O errors propagated from collaborators
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Request construction errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for errors that convert a request to pass-through at a higher
    /// layer rather than failing it outright.
    #[must_use]
    pub fn is_mapping_failure(&self) -> bool {
        matches!(
            self,
            Self::MappingFailed { .. }
                | Self::NoEvictableLines
                | Self::LockNotAcquired
                | Self::PartitionDisabled(_)
        )
    }
}
