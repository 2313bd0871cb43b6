//! Download coordinator.
//!
//! Each cycle lists the device's logs, registers any new ones, then pulls
//! pending logs one at a time, most recent first. A log whose transfer
//! fails is skipped for the rest of the cycle so older logs still move.

use crate::blocking::with_registry;
use crate::device::DeviceLink;
use crate::error::{SyncError, SyncResult};
use crate::gate::GateHandle;
use crate::scheduler::sleep_or_shutdown;
use logloader_registry::LogRegistry;
use logloader_types::{marker_path, DownloadState, Fingerprint, LogEntry, LogRecord};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Download loop settings.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Pause between cycles.
    pub interval: Duration,
    /// Backoff after a failed listing.
    pub listing_retry: Duration,
    /// Consecutive listing misses before a pending log is given up on.
    pub max_listing_misses: u32,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            listing_retry: Duration::from_secs(5),
            max_listing_misses: 3,
        }
    }
}

/// What one download cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entries in the device listing.
    pub listed: usize,
    /// Entries seen for the first time.
    pub discovered: usize,
    pub downloaded: usize,
    pub failed: usize,
    /// Logs marked done because they disappeared from the device.
    pub given_up: usize,
    /// Logs missing from this listing but not given up on yet.
    pub missing: usize,
    /// The gate closed before every pending log was attempted.
    pub paused: bool,
}

pub struct DownloadCoordinator {
    device: Arc<dyn DeviceLink>,
    registry: LogRegistry,
    gate: GateHandle,
    logs_dir: PathBuf,
    settings: DownloadSettings,
}

impl DownloadCoordinator {
    pub fn new(
        device: Arc<dyn DeviceLink>,
        registry: LogRegistry,
        gate: GateHandle,
        logs_dir: PathBuf,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            device,
            registry,
            gate,
            logs_dir,
            settings,
        }
    }

    /// Runs download cycles until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            if !self.gate.wait_until_open(&shutdown).await {
                break;
            }

            let pause = match self.run_cycle(&shutdown).await {
                // Resume as soon as the gate reopens.
                Ok(report) if report.paused => continue,
                Ok(report) => {
                    debug!("Download cycle finished: {report:?}");
                    self.settings.interval
                }
                Err(SyncError::Cancelled) => break,
                Err(e) if e.is_retryable() => {
                    warn!("Download cycle failed: {e}");
                    self.settings.listing_retry
                }
                Err(e) => {
                    error!("Download cycle failed: {e}");
                    self.settings.interval
                }
            };

            if !sleep_or_shutdown(pause, &shutdown).await {
                break;
            }
        }
        info!("Download coordinator stopped");
    }

    /// Runs one listing-and-download cycle.
    ///
    /// Returns an error if the listing failed or shutdown was requested;
    /// individual transfer failures are counted in the report instead.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> SyncResult<CycleReport> {
        let mut report = CycleReport::default();

        debug!("Requesting log entries...");
        let started = Instant::now();
        let entries = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Err(SyncError::Cancelled),
            entries = self.device.list_entries() => entries?,
        };
        report.listed = entries.len();
        debug!(
            "Received {} log entries in {:.2} seconds",
            entries.len(),
            started.elapsed().as_secs_f64()
        );

        let records: Vec<LogRecord> = entries.iter().map(LogRecord::from_entry).collect();
        report.discovered = with_registry(&self.registry, move |registry| {
            let mut discovered = 0;
            for record in &records {
                if registry.upsert(record)? {
                    discovered += 1;
                }
            }
            Ok(discovered)
        })
        .await?;
        if report.discovered > 0 {
            info!("Discovered {} new log(s)", report.discovered);
        }

        let by_fingerprint: HashMap<Fingerprint, LogEntry> = entries
            .into_iter()
            .map(|entry| (entry.fingerprint(), entry))
            .collect();

        let total = with_registry(&self.registry, |registry| registry.pending_download_count()).await?;
        let mut excluded: HashSet<Fingerprint> = HashSet::new();
        let mut attempt = 0;

        loop {
            if shutdown.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if !self.gate.is_open() {
                debug!("Gate closed, ending download cycle");
                report.paused = true;
                break;
            }

            let exclude = excluded.clone();
            let Some(record) = with_registry(&self.registry, move |registry| {
                registry.next_to_download_excluding(&exclude)
            })
            .await?
            else {
                break;
            };

            let Some(entry) = by_fingerprint.get(&record.fingerprint) else {
                if self.handle_missing(&record).await? {
                    report.given_up += 1;
                } else {
                    report.missing += 1;
                    excluded.insert(record.fingerprint.clone());
                }
                continue;
            };

            if record.listing_misses > 0 {
                let fingerprint = record.fingerprint.clone();
                with_registry(&self.registry, move |registry| {
                    registry.reset_listing_misses(&fingerprint)
                })
                .await?;
            }

            attempt += 1;
            info!("Downloading log {}/{}", attempt, total.max(attempt));

            match self.download(&record, entry, shutdown).await {
                Ok(()) => report.downloaded += 1,
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    let fingerprint = record.fingerprint.clone();
                    let failures = with_registry(&self.registry, move |registry| {
                        registry.record_download_failure(&fingerprint)
                    })
                    .await?;
                    warn!(
                        "Download of {} failed ({} attempt(s)): {e}",
                        record.file_name(),
                        failures
                    );
                    report.failed += 1;
                    excluded.insert(record.fingerprint.clone());
                }
            }
        }

        Ok(report)
    }

    /// Counts a listing miss. Returns true if the log was given up on.
    async fn handle_missing(&self, record: &LogRecord) -> SyncResult<bool> {
        let fingerprint = record.fingerprint.clone();
        let max = self.settings.max_listing_misses;
        let (misses, given_up) = with_registry(&self.registry, move |registry| {
            let misses = registry.record_listing_miss(&fingerprint)?;
            let give_up = misses >= max;
            if give_up {
                registry.set_downloaded(&fingerprint, true)?;
            }
            Ok((misses, give_up))
        })
        .await?;

        if given_up {
            warn!(
                "{} no longer on the device after {} listings, giving up",
                record.file_name(),
                misses
            );
        } else {
            debug!(
                "{} missing from listing ({}/{})",
                record.file_name(),
                misses,
                max
            );
        }
        Ok(given_up)
    }

    async fn download(
        &self,
        record: &LogRecord,
        entry: &LogEntry,
        shutdown: &CancellationToken,
    ) -> SyncResult<()> {
        let path = record.local_path(&self.logs_dir);
        let marker = marker_path(&path);

        // Left behind by an interrupted transfer.
        if remove_if_exists(&path).await? {
            info!("Found existing file, removed: {}", path.display());
        }

        tokio::fs::write(&marker, b"").await?;
        let fingerprint = record.fingerprint.clone();
        with_registry(&self.registry, move |registry| {
            registry.set_download_state(&fingerprint, DownloadState::InProgress)
        })
        .await?;

        info!("Downloading {}", path.display());
        let started = Instant::now();
        let result = self.transfer(entry, &path, shutdown).await;

        if let Err(e) = remove_if_exists(&marker).await {
            warn!("Failed to remove {}: {e}", marker.display());
        }

        let fingerprint = record.fingerprint.clone();
        match result {
            Ok(()) => {
                with_registry(&self.registry, move |registry| {
                    registry.set_download_state(&fingerprint, DownloadState::Complete)
                })
                .await?;
                info!(
                    "Finished {} in {:.2} seconds",
                    record.file_name(),
                    started.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(SyncError::Cancelled) => {
                info!("Download cancelled: {}", record.file_name());
                with_registry(&self.registry, move |registry| {
                    registry.set_download_state(&fingerprint, DownloadState::NotStarted)
                })
                .await?;
                Err(SyncError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    async fn transfer(
        &self,
        entry: &LogEntry,
        path: &Path,
        shutdown: &CancellationToken,
    ) -> SyncResult<()> {
        let transfer = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Err(SyncError::Cancelled),
            transfer = self.device.begin_transfer(entry, path) => transfer?,
        };

        let size_mb = entry.size_bytes as f64 / 1e6;
        let mut last_percent = 0;
        transfer
            .wait(shutdown, |fraction| {
                let percent = (fraction * 100.0) as u32;
                if percent >= last_percent + 10 {
                    last_percent = percent;
                    debug!("Downloading {:<24} {:>8.2}MB {:>4}%", entry.date, size_mb, percent);
                }
            })
            .await
    }
}

/// Removes a file. Returns false if it did not exist.
pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
