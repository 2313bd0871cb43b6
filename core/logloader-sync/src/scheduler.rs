//! Top-level loop: runs the pause gate, the download coordinator and one
//! upload coordinator per destination until shutdown.

use crate::blocking::with_registry;
use crate::config::{LoaderConfig, TimingConfig};
use crate::destination::{HttpDestination, UploadDestination};
use crate::device::DeviceLink;
use crate::download::{remove_if_exists, DownloadCoordinator, DownloadSettings};
use crate::error::SyncResult;
use crate::gate::PauseGate;
use crate::upload::UploadCoordinator;
use logloader_registry::LogRegistry;
use logloader_types::marker_path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sleeps for `duration` unless `shutdown` fires first.
///
/// Returns `true` if the full duration elapsed.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

/// Cadences of every loop, resolved to durations.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub download: DownloadSettings,
    pub upload_interval: Duration,
    pub gate_poll: Duration,
    pub settle_delay: Duration,
    pub connect_retry: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::from_config(&LoaderConfig::default())
    }
}

impl Schedule {
    pub fn from_config(config: &LoaderConfig) -> Self {
        let timing: &TimingConfig = &config.timing;
        Self {
            download: DownloadSettings {
                interval: Duration::from_secs(timing.download_interval_secs),
                listing_retry: Duration::from_secs(timing.listing_retry_secs),
                max_listing_misses: config.policy.max_listing_misses,
            },
            upload_interval: Duration::from_secs(timing.upload_interval_secs),
            gate_poll: Duration::from_millis(timing.gate_poll_millis),
            settle_delay: Duration::from_secs(timing.settle_delay_secs),
            connect_retry: timing.connect_retry(),
        }
    }
}

/// The log loader: one device, one registry, any number of destinations.
pub struct LogLoader {
    device: Arc<dyn DeviceLink>,
    registry: LogRegistry,
    destinations: Vec<Arc<dyn UploadDestination>>,
    logs_dir: PathBuf,
    schedule: Schedule,
}

impl LogLoader {
    pub fn new(
        device: Arc<dyn DeviceLink>,
        registry: LogRegistry,
        logs_dir: PathBuf,
        schedule: Schedule,
    ) -> Self {
        Self {
            device,
            registry,
            destinations: Vec::new(),
            logs_dir,
            schedule,
        }
    }

    /// Builds a loader with an HTTP destination for every enabled server.
    pub fn from_config(
        config: &LoaderConfig,
        device: Arc<dyn DeviceLink>,
        registry: LogRegistry,
    ) -> SyncResult<Self> {
        let mut loader = Self::new(
            device,
            registry,
            config.logs_directory(),
            Schedule::from_config(config),
        );
        for destination in config.destinations() {
            info!("Upload destination {}: {}", destination.id, destination.base_url);
            let http = HttpDestination::new(destination, config.timing.request_timeout())?;
            loader = loader.with_destination(Arc::new(http));
        }
        Ok(loader)
    }

    /// Adds an upload destination.
    pub fn with_destination(mut self, destination: Arc<dyn UploadDestination>) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Resets downloads interrupted by a previous run and removes their
    /// partial files. Returns the number of logs reset.
    pub async fn recover(&self) -> SyncResult<usize> {
        let recovered = with_registry(&self.registry, |registry| registry.recover_interrupted()).await?;
        for record in &recovered {
            let path = record.local_path(&self.logs_dir);
            for stale in [marker_path(&path), path] {
                if let Err(e) = remove_if_exists(&stale).await {
                    warn!("Failed to remove {}: {e}", stale.display());
                }
            }
        }
        Ok(recovered.len())
    }

    /// Retries the device connection until it succeeds.
    ///
    /// Returns `false` if `shutdown` fired first.
    pub async fn wait_for_device(&self, shutdown: &CancellationToken) -> bool {
        info!("Connecting to {}", self.device.describe());
        loop {
            let connected = tokio::select! {
                biased;
                () = shutdown.cancelled() => return false,
                result = self.device.connect() => result,
            };
            match connected {
                Ok(()) => {
                    info!("Connected.");
                    return true;
                }
                Err(e) => warn!("Connection failed: {e}"),
            }
            if !sleep_or_shutdown(self.schedule.connect_retry, shutdown).await {
                return false;
            }
        }
    }

    /// Runs every loop until `shutdown` fires, then waits for all of them.
    ///
    /// A panicking loop stops the others.
    pub async fn run(self, shutdown: CancellationToken) -> SyncResult<()> {
        let shutdown = shutdown.child_token();
        let gate = PauseGate::new();
        let mut tasks = JoinSet::new();

        let download = DownloadCoordinator::new(
            Arc::clone(&self.device),
            self.registry.clone(),
            gate.subscribe(),
            self.logs_dir.clone(),
            self.schedule.download.clone(),
        );
        tasks.spawn(download.run(shutdown.clone()));

        for destination in &self.destinations {
            let upload = UploadCoordinator::new(
                Arc::clone(destination),
                self.registry.clone(),
                gate.subscribe(),
                self.logs_dir.clone(),
                self.schedule.upload_interval,
            );
            tasks.spawn(upload.run(shutdown.clone()));
        }

        tasks.spawn(gate.run(
            Arc::clone(&self.device),
            self.schedule.gate_poll,
            self.schedule.settle_delay,
            shutdown.clone(),
        ));

        info!(
            "Log loader running with {} upload destination(s)",
            self.destinations.len()
        );

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Loader task failed: {e}");
                shutdown.cancel();
                result = Err(e.into());
            }
        }

        info!("Log loader stopped");
        result
    }
}
