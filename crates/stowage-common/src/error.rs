//! Error types for Stowage
//!
//! This module defines the error taxonomy shared by the WAL, the processor,
//! the cache and the health monitor.

use crate::types::{BackendId, OperationId, OperationStatus};
use thiserror::Error;

/// Common result type for Stowage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Stowage
#[derive(Debug, Error)]
pub enum Error {
    // WAL errors
    #[error("WAL capacity exceeded: required {required} bytes, available {available} bytes")]
    CapacityExceeded { required: u64, available: u64 },

    #[error("operation not found: {0}")]
    NotFound(OperationId),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("partition not found: {backend}/{seq}")]
    PartitionNotFound { backend: BackendId, seq: u64 },

    #[error("WAL corruption detected: {0}")]
    Corruption(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    // Backend errors
    #[error("transient backend error: {0}")]
    BackendTransient(String),

    #[error("permanent backend error: {0}")]
    BackendPermanent(String),

    #[error("circuit open for backend {0}")]
    CircuitOpen(BackendId),

    #[error("unknown backend: {0}")]
    UnknownBackend(BackendId),

    // Internal errors
    #[error("timed out")]
    Timeout,

    #[error("shutting down")]
    ShuttingDown,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendTransient(_) | Self::Timeout | Self::CircuitOpen(_)
        )
    }

    /// Errors that indicate a programming or medium fault and must surface
    /// to the caller unchanged
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::NotFound(_)
                | Self::InvalidTransition { .. }
                | Self::Corruption(_)
        )
    }

    /// Map an I/O error from the WAL medium, turning a full device into
    /// `CapacityExceeded`
    pub fn from_wal_io(err: std::io::Error, required: u64) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            Self::CapacityExceeded {
                required,
                available: 0,
            }
        } else {
            Self::Io(err)
        }
    }
}
