//! Error types for dostore
//!
//! This module defines the error taxonomy reported by the storage engine
//! to its callers. Low-level failures (filesystem, embedded database,
//! encoding) are folded into these variants at the facade boundary.

use thiserror::Error;

/// Common result type for dostore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for dostore
#[derive(Debug, Error)]
pub enum Error {
    // Object lifecycle errors
    #[error("object already exists: {0}")]
    ObjectAlreadyExists(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("element not found: {object}/{element}")]
    ElementNotFound { object: String, element: String },

    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("inconsistent metadata: {0}")]
    Inconsistent(String),

    /// A write carrying a timestamp older than the one already stored.
    #[error(
        "stale write rejected for {object}{}: stored timestamp {stored}, attempted {attempted}",
        .element.as_deref().map(|e| format!("/{e}")).unwrap_or_default()
    )]
    StaleWrite {
        object: String,
        element: Option<String>,
        stored: u64,
        attempted: u64,
    },

    #[error("storage is read-only")]
    ReadOnly,

    #[error("transaction log error: {0}")]
    TransactionLog(String),

    // Request errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an inconsistent-metadata error
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_) | Self::ElementNotFound { .. })
    }

    /// Check if this is a rejected out-of-order write
    #[must_use]
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::StaleWrite { .. })
    }

    /// Whether the caller should treat the failure as fatal for the
    /// operation. Stale writes are expected under replication replay and
    /// only mean the stored state is already newer.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !self.is_stale_write()
    }
}
