//! Upload coordinator, one per destination.
//!
//! A pass repeatedly takes the most recent downloaded log that the
//! destination has not accepted yet and submits it. Logs that cannot be
//! attempted right now (still downloading, missing, empty, or failed
//! transiently) are set aside until the next pass. An unreachable
//! destination ends the pass.

use crate::blocking::with_registry;
use crate::destination::{UploadDestination, UploadForm, UploadOutcome};
use crate::error::{SyncError, SyncResult};
use crate::gate::GateHandle;
use crate::scheduler::sleep_or_shutdown;
use logloader_registry::LogRegistry;
use logloader_types::{marker_path, Fingerprint, LogRecord};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of attempting a single log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadAttempt {
    /// Accepted by the destination.
    Uploaded { url: String },
    /// Permanently refused; the log is now denylisted.
    Rejected { reason: String },
    /// Not attempted: the local file is not ready or not usable.
    Skipped { reason: String },
    /// Attempted and failed, locally or remotely; will be retried next pass.
    Deferred { message: String },
    /// The destination did not answer the reachability probe.
    Unreachable,
}

/// What one upload pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub uploaded: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub unreachable: bool,
    /// The gate closed before the pass finished.
    pub paused: bool,
}

pub struct UploadCoordinator {
    destination: Arc<dyn UploadDestination>,
    form: UploadForm,
    registry: LogRegistry,
    gate: GateHandle,
    logs_dir: PathBuf,
    interval: Duration,
}

impl UploadCoordinator {
    pub fn new(
        destination: Arc<dyn UploadDestination>,
        registry: LogRegistry,
        gate: GateHandle,
        logs_dir: PathBuf,
        interval: Duration,
    ) -> Self {
        let form = UploadForm::for_destination(destination.descriptor());
        Self {
            destination,
            form,
            registry,
            gate,
            logs_dir,
            interval,
        }
    }

    /// Runs upload passes until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let id = self.destination.id().clone();
        loop {
            if !self.gate.wait_until_open(&shutdown).await {
                break;
            }

            match self.run_pass(&shutdown).await {
                Ok(report) if report.paused => continue,
                Ok(report) if report != PassReport::default() => {
                    debug!("Upload pass to {id} finished: {report:?}");
                }
                Ok(_) => {}
                Err(SyncError::Cancelled) => break,
                Err(e) => warn!("Upload pass to {id} failed: {e}"),
            }

            if !sleep_or_shutdown(self.interval, &shutdown).await {
                break;
            }
        }
        info!("Upload coordinator for {id} stopped");
    }

    /// Uploads every eligible log once.
    pub async fn run_pass(&self, shutdown: &CancellationToken) -> SyncResult<PassReport> {
        let id = self.destination.id().clone();
        let mut report = PassReport::default();
        let mut excluded: HashSet<Fingerprint> = HashSet::new();

        let pending = {
            let id = id.clone();
            with_registry(&self.registry, move |registry| registry.pending_upload_count(&id)).await?
        };
        if pending == 0 {
            return Ok(report);
        }
        debug!("Uploading {pending} log(s) to {id}");

        loop {
            if shutdown.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if !self.gate.is_open() {
                debug!("Gate closed, ending upload pass to {id}");
                report.paused = true;
                break;
            }

            let exclude = excluded.clone();
            let dest = id.clone();
            let Some(record) = with_registry(&self.registry, move |registry| {
                registry.next_to_upload_excluding(&dest, &exclude)
            })
            .await?
            else {
                break;
            };

            match self.upload(&record, shutdown).await? {
                UploadAttempt::Uploaded { url } => {
                    info!("Log upload to {id} SUCCESS: {url}");
                    report.uploaded += 1;
                }
                UploadAttempt::Rejected { reason } => {
                    warn!(
                        "Log upload of {} to {id} rejected ({reason}), will not retry",
                        record.file_name()
                    );
                    report.rejected += 1;
                }
                UploadAttempt::Skipped { reason } => {
                    debug!("Skipping {} for {id}: {reason}", record.file_name());
                    report.skipped += 1;
                    excluded.insert(record.fingerprint.clone());
                }
                UploadAttempt::Deferred { message } => {
                    warn!(
                        "Log upload of {} to {id} TEMPORARILY FAILED ({message}), will retry later",
                        record.file_name()
                    );
                    report.deferred += 1;
                    excluded.insert(record.fingerprint.clone());
                }
                UploadAttempt::Unreachable => {
                    report.unreachable = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Attempts one log and records the outcome in the registry.
    pub async fn upload(
        &self,
        record: &LogRecord,
        shutdown: &CancellationToken,
    ) -> SyncResult<UploadAttempt> {
        let fingerprint = record.fingerprint.clone();
        let denylisted =
            with_registry(&self.registry, move |registry| registry.is_denylisted(&fingerprint)).await?;
        if denylisted {
            return Ok(UploadAttempt::Skipped {
                reason: "denylisted".to_string(),
            });
        }

        let path = record.local_path(&self.logs_dir);
        if tokio::fs::try_exists(marker_path(&path)).await? {
            return Ok(UploadAttempt::Skipped {
                reason: "download in progress".to_string(),
            });
        }
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.len() == 0 => {
                warn!("Skipping zero-size log file: {}", path.display());
                return Ok(UploadAttempt::Skipped {
                    reason: "zero-size file".to_string(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Log file does not exist: {}", path.display());
                return Ok(UploadAttempt::Skipped {
                    reason: "file missing".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let probe = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Err(SyncError::Cancelled),
            probe = self.destination.probe() => probe,
        };
        if let Err(e) = probe {
            warn!("{} unreachable: {e}", self.destination.id());
            return Ok(UploadAttempt::Unreachable);
        }

        info!("Uploading {} to {}", record.file_name(), self.destination.id());
        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Err(SyncError::Cancelled),
            outcome = self.destination.submit(&path, &self.form) => outcome,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                return Ok(UploadAttempt::Deferred {
                    message: e.to_string(),
                });
            }
        };

        let fingerprint = record.fingerprint.clone();
        match outcome {
            UploadOutcome::Uploaded { url } => {
                let id = self.destination.id().clone();
                with_registry(&self.registry, move |registry| {
                    registry.set_uploaded(&fingerprint, &id, true)
                })
                .await?;
                Ok(UploadAttempt::Uploaded { url })
            }
            UploadOutcome::Rejected { reason } => {
                let stored = reason.clone();
                with_registry(&self.registry, move |registry| {
                    registry.add_to_denylist(&fingerprint, &stored)
                })
                .await?;
                Ok(UploadAttempt::Rejected { reason })
            }
            UploadOutcome::Transient { message, .. } => Ok(UploadAttempt::Deferred { message }),
        }
    }
}
