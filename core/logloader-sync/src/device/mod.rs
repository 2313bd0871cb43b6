//! Device link abstraction.
//!
//! The device exposes a list of logs, streams one log at a time to a local
//! path, and reports whether it is currently busy writing a log.

mod mounted;

pub use mounted::MountedStorageLink;

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use logloader_types::LogEntry;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events emitted by a running transfer.
#[derive(Debug)]
pub enum TransferEvent {
    /// Fraction of the log written so far, in `0.0..=1.0`.
    Progress { fraction: f32 },
    /// The transfer ended. This is always the last event.
    Finished(SyncResult<()>),
}

/// Link to the device that produces logs.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Human-readable description of the link, for logging.
    fn describe(&self) -> String;

    /// Checks that the device is reachable.
    async fn connect(&self) -> SyncResult<()>;

    /// Lists the logs currently stored on the device.
    ///
    /// Entry ids are only meaningful until the next listing.
    async fn list_entries(&self) -> SyncResult<Vec<LogEntry>>;

    /// Starts copying `entry` to `destination` in the background.
    async fn begin_transfer(&self, entry: &LogEntry, destination: &Path) -> SyncResult<Transfer>;

    /// Returns true while the device is writing a log.
    async fn is_busy(&self) -> SyncResult<bool>;
}

const EVENT_CAPACITY: usize = 32;

/// Handle to an in-flight transfer.
///
/// Dropping the handle cancels the transfer.
pub struct Transfer {
    events: mpsc::Receiver<TransferEvent>,
    cancel: CancellationToken,
}

/// Producer side of a [`Transfer`], held by the link's copy task.
pub struct TransferReporter {
    events: mpsc::Sender<TransferEvent>,
    cancel: CancellationToken,
}

impl Transfer {
    /// Creates a connected reporter/handle pair.
    pub fn channel() -> (TransferReporter, Transfer) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        (
            TransferReporter {
                events: tx,
                cancel: cancel.clone(),
            },
            Transfer { events: rx, cancel },
        )
    }

    /// Asks the link to abandon the transfer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Receives the next event, or `None` once the link has gone away.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Drives the transfer to completion.
    ///
    /// If `shutdown` fires first the transfer is cancelled, the link is given
    /// the chance to unwind, and `SyncError::Cancelled` is returned.
    pub async fn wait<F>(mut self, shutdown: &CancellationToken, mut on_progress: F) -> SyncResult<()>
    where
        F: FnMut(f32),
    {
        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    self.cancel();
                    self.drain().await;
                    return Err(SyncError::Cancelled);
                }
                event = self.events.recv() => event,
            };

            match event {
                Some(TransferEvent::Progress { fraction }) => on_progress(fraction),
                Some(TransferEvent::Finished(result)) => return result,
                None => {
                    return Err(SyncError::Device("transfer ended without a result".to_string()));
                }
            }
        }
    }

    async fn drain(&mut self) {
        while let Some(event) = self.events.recv().await {
            if matches!(event, TransferEvent::Finished(_)) {
                break;
            }
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TransferReporter {
    /// Reports progress. Dropped if the consumer is lagging.
    pub fn progress(&self, fraction: f32) {
        let _ = self.events.try_send(TransferEvent::Progress {
            fraction: fraction.clamp(0.0, 1.0),
        });
    }

    /// Reports the final result.
    pub async fn finish(self, result: SyncResult<()>) {
        let _ = self.events.send(TransferEvent::Finished(result)).await;
    }

    /// Returns true once the consumer asked to cancel.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the consumer asks to cancel.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
