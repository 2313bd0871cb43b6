//! Log listing entries, persisted records and denylist entries.

use crate::{DestinationId, Fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A log as reported by the device in a single listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Device-assigned index. Only valid for the session that produced it.
    pub id: u32,
    /// ISO-8601 timestamp reported by the device.
    pub date: String,
    /// Size in bytes at listing time.
    pub size_bytes: u64,
}

impl LogEntry {
    /// Creates a listing entry.
    pub fn new(id: u32, date: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id,
            date: date.into(),
            size_bytes,
        }
    }

    /// Returns the stable identity of this log.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_parts(&self.date, self.size_bytes)
    }

    /// Returns the local file name, `LOG<id:04>_<date>.ulg`.
    #[must_use]
    pub fn file_name(&self) -> String {
        file_name(self.id, &self.date)
    }
}

/// Download lifecycle of a log.
///
/// `InProgress` replaces a sidecar lock file as the signal that the local
/// file is incomplete; it is reset to `NotStarted` on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Not downloaded yet (or a previous attempt failed).
    #[default]
    NotStarted,
    /// A transfer is writing the local file.
    InProgress,
    /// The local file is complete, or the log was given up on.
    Complete,
}

impl DownloadState {
    /// Returns the persisted representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            other => Err(crate::Error::InvalidDownloadState(other.to_string())),
        }
    }
}

/// Persisted state of one discovered log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Primary key.
    pub fingerprint: Fingerprint,
    /// Device index at discovery time, used for file naming and display.
    pub id: u32,
    /// ISO-8601 timestamp reported by the device.
    pub date: String,
    /// Size reported by the device at discovery time.
    pub size_bytes: u64,
    /// Download lifecycle.
    pub download_state: DownloadState,
    /// Destinations this log has been uploaded to.
    pub uploaded_to: BTreeSet<DestinationId>,
    /// Number of failed transfer attempts.
    pub download_failures: u32,
    /// Consecutive listings in which a pending log was not found.
    pub listing_misses: u32,
}

impl LogRecord {
    /// Creates a fresh record for a newly discovered log.
    #[must_use]
    pub fn from_entry(entry: &LogEntry) -> Self {
        Self {
            fingerprint: entry.fingerprint(),
            id: entry.id,
            date: entry.date.clone(),
            size_bytes: entry.size_bytes,
            download_state: DownloadState::NotStarted,
            uploaded_to: BTreeSet::new(),
            download_failures: 0,
            listing_misses: 0,
        }
    }

    /// Returns true once the log no longer needs downloading.
    #[must_use]
    pub fn downloaded(&self) -> bool {
        self.download_state == DownloadState::Complete
    }

    /// Returns true if the log was uploaded to the named destination.
    #[must_use]
    pub fn is_uploaded(&self, destination: &DestinationId) -> bool {
        self.uploaded_to.contains(destination)
    }

    /// Returns the local file name, `LOG<id:04>_<date>.ulg`.
    #[must_use]
    pub fn file_name(&self) -> String {
        file_name(self.id, &self.date)
    }

    /// Returns the path of the local file inside `logs_dir`.
    #[must_use]
    pub fn local_path(&self, logs_dir: &Path) -> PathBuf {
        logs_dir.join(self.file_name())
    }
}

/// A log whose upload was permanently rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenylistEntry {
    pub fingerprint: Fingerprint,
    /// Human-readable rejection reason.
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Returns the transfer-in-progress marker path for a local log file.
#[must_use]
pub fn marker_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn file_name(id: u32, date: &str) -> String {
    format!("LOG{id:04}_{date}.ulg")
}
