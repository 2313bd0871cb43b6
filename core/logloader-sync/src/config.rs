//! Loader configuration, read from a TOML file.
//!
//! Top-level keys keep the names used by existing deployments (`email`,
//! `local_server`, `remote_server`, `upload_enabled`, `public_logs`,
//! `application_directory`). Every key is optional.

use crate::destination::DestinationConfig;
use crate::error::{SyncError, SyncResult};
use logloader_types::DestinationId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default public log server.
pub const DEFAULT_REMOTE_SERVER: &str = "logs.px4.io";

/// Complete loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Email attached to uploads on the remote server.
    pub email: String,
    /// On-premises log server. Empty disables it.
    pub local_server: String,
    /// Public log server. Empty disables it.
    pub remote_server: String,
    /// Enables uploads to the remote server.
    pub upload_enabled: bool,
    /// Visibility of logs uploaded to the remote server.
    pub public_logs: bool,
    /// Root for downloaded logs and the registry database.
    pub application_directory: PathBuf,
    pub device: DeviceConfig,
    pub timing: TimingConfig,
    pub policy: PolicyConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            local_server: String::new(),
            remote_server: DEFAULT_REMOTE_SERVER.to_string(),
            upload_enabled: false,
            public_logs: false,
            application_directory: PathBuf::from("."),
            device: DeviceConfig::default(),
            timing: TimingConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

/// Where the device's log storage is mounted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Directory holding the device's `.ulg` files.
    pub root: PathBuf,
    /// File whose presence means the device is busy writing a log.
    /// Relative paths are resolved against `root`.
    pub busy_marker: Option<PathBuf>,
    /// Copy chunk size in bytes.
    pub chunk_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/mnt/microsd/log"),
            busy_marker: None,
            chunk_size: 64 * 1024,
        }
    }
}

/// Loop cadences. All values are in whole seconds unless named otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause between download cycles.
    pub download_interval_secs: u64,
    /// Backoff after a failed device listing.
    pub listing_retry_secs: u64,
    /// Pause between upload passes.
    pub upload_interval_secs: u64,
    /// Busy-signal polling period.
    pub gate_poll_millis: u64,
    /// Quiet period after the device stops being busy.
    pub settle_delay_secs: u64,
    /// Delay between device connection attempts at startup.
    pub connect_retry_secs: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            download_interval_secs: 30,
            listing_retry_secs: 5,
            upload_interval_secs: 5,
            gate_poll_millis: 1000,
            settle_delay_secs: 3,
            connect_retry_secs: 3,
            request_timeout_secs: 60,
        }
    }
}

impl TimingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs)
    }
}

/// Retry policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Consecutive listings a pending log may be missing from before it is
    /// given up on.
    pub max_listing_misses: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_listing_misses: 3,
        }
    }
}

impl LoaderConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates a configuration document.
    pub fn from_toml_str(content: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> SyncResult<()> {
        if self.timing.gate_poll_millis == 0 {
            return Err(SyncError::Config("timing.gate_poll_millis must be positive".into()));
        }
        if self.policy.max_listing_misses == 0 {
            return Err(SyncError::Config("policy.max_listing_misses must be positive".into()));
        }
        if self.device.chunk_size == 0 {
            return Err(SyncError::Config("device.chunk_size must be positive".into()));
        }
        Ok(())
    }

    /// Directory downloaded logs are written to.
    pub fn logs_directory(&self) -> PathBuf {
        self.application_directory.join("logs")
    }

    /// Path of the registry database.
    pub fn registry_path(&self) -> PathBuf {
        self.application_directory.join("logloader.db")
    }

    /// Returns the enabled upload destinations.
    ///
    /// The local server always receives every log as public with no email,
    /// so logs stay searchable in its web UI. The remote server is only used
    /// when `upload_enabled` is set.
    pub fn destinations(&self) -> Vec<DestinationConfig> {
        let mut destinations = Vec::new();
        if !self.local_server.trim().is_empty() {
            destinations.push(DestinationConfig {
                id: DestinationId::local(),
                base_url: normalize_server_url(&self.local_server),
                email: String::new(),
                public: true,
            });
        }
        if self.upload_enabled && !self.remote_server.trim().is_empty() {
            destinations.push(DestinationConfig {
                id: DestinationId::remote(),
                base_url: normalize_server_url(&self.remote_server),
                email: self.email.clone(),
                public: self.public_logs,
            });
        }
        destinations
    }
}

/// Adds `https://` to a server address without a scheme and strips trailing slashes.
pub fn normalize_server_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}
