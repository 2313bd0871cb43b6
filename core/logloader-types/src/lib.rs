//! Core type definitions for logloader.
//!
//! This crate defines the types shared by the registry and the sync engine:
//! - Log fingerprints derived from `(date, size_bytes)`
//! - Destination names keying per-destination upload state
//! - Device listing entries and the persisted per-log record
//! - Denylist entries for permanently rejected uploads
//! - Local file naming for downloaded logs

mod destination;
mod fingerprint;
mod log;

pub use destination::DestinationId;
pub use fingerprint::Fingerprint;
pub use log::{marker_path, DenylistEntry, DownloadState, LogEntry, LogRecord};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("invalid destination name: {0:?}")]
    InvalidDestination(String),

    #[error("invalid download state: {0}")]
    InvalidDownloadState(String),
}
