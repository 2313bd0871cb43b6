//! Error types for the sync layer.

use logloader_registry::RegistryError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The device link failed (listing, transfer or busy query).
    #[error("device error: {0}")]
    Device(String),

    /// An upload destination could not be reached or misbehaved.
    #[error("network error: {0}")]
    Network(String),

    /// Local filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation was abandoned because shutdown was requested.
    #[error("operation cancelled")]
    Cancelled,

    /// A background task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Returns true if the failed operation should be retried on the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Device(_) | Self::Network(_) | Self::Io(_) | Self::Task(_)
        )
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
