//! Error types for the log registry.

use logloader_types::Fingerprint;
use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur in registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A previous holder of the connection lock panicked.
    #[error("registry lock poisoned")]
    Poisoned,

    /// A stored row could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// An update named a fingerprint that was never upserted.
    #[error("unknown log: {0}")]
    UnknownLog(Fingerprint),
}
