//! Shared test helpers: scripted device and destination fakes.

#![allow(dead_code)]

use async_trait::async_trait;
use logloader_sync::{
    DestinationConfig, DeviceLink, SyncError, SyncResult, Transfer, UploadDestination, UploadForm,
    UploadOutcome,
};
use logloader_types::{DestinationId, LogEntry};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scenario A log.
pub fn log_a() -> LogEntry {
    LogEntry::new(12, "2024-01-01T00:00:00Z", 1000)
}

/// Scenario B log.
pub fn log_b() -> LogEntry {
    LogEntry::new(13, "2024-01-02T00:00:00Z", 500)
}

/// Polls `condition` every 10 ms until it holds, panicking after `timeout`.
pub async fn eventually<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── FakeDevice ───────────────────────────────────────────────────

/// How a scripted transfer behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferScript {
    /// Writes `size_bytes` bytes and succeeds.
    Complete,
    /// Fails without writing anything.
    Fail,
    /// Writes half the file and waits to be cancelled.
    Hang,
}

/// In-memory device with a scripted listing and transfers.
#[derive(Default)]
pub struct FakeDevice {
    entries: Mutex<Vec<LogEntry>>,
    scripts: Mutex<HashMap<u32, TransferScript>>,
    busy: AtomicBool,
    fail_listing: AtomicBool,
    connect_failures: AtomicUsize,
    started: Mutex<Vec<u32>>,
    listings: AtomicUsize,
    listing_delay_ms: AtomicU64,
}

impl FakeDevice {
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        let device = Self::default();
        device.set_entries(entries);
        device
    }

    pub fn set_entries(&self, entries: Vec<LogEntry>) {
        *self.entries.lock().unwrap() = entries;
    }

    pub fn script(&self, id: u32, script: TransferScript) {
        self.scripts.lock().unwrap().insert(id, script);
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Makes every listing take `delay` before answering.
    pub fn set_listing_delay(&self, delay: Duration) {
        self.listing_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Ids of every transfer started so far, in order.
    pub fn started(&self) -> Vec<u32> {
        self.started.lock().unwrap().clone()
    }

    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceLink for FakeDevice {
    fn describe(&self) -> String {
        "fake device".to_string()
    }

    async fn connect(&self) -> SyncResult<()> {
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::Device("no heartbeat".to_string()));
        }
        Ok(())
    }

    async fn list_entries(&self) -> SyncResult<Vec<LogEntry>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let delay = self.listing_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(SyncError::Device("listing timed out".to_string()));
        }
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn begin_transfer(&self, entry: &LogEntry, destination: &Path) -> SyncResult<Transfer> {
        self.started.lock().unwrap().push(entry.id);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&entry.id)
            .copied()
            .unwrap_or(TransferScript::Complete);

        let (reporter, transfer) = Transfer::channel();
        let destination = destination.to_path_buf();
        let size = entry.size_bytes as usize;

        tokio::spawn(async move {
            match script {
                TransferScript::Complete => {
                    reporter.progress(0.5);
                    let result = tokio::fs::write(&destination, vec![b'x'; size])
                        .await
                        .map_err(SyncError::from);
                    reporter.progress(1.0);
                    reporter.finish(result).await;
                }
                TransferScript::Fail => {
                    reporter
                        .finish(Err(SyncError::Device("link lost".to_string())))
                        .await;
                }
                TransferScript::Hang => {
                    let _ = tokio::fs::write(&destination, vec![b'x'; size / 2]).await;
                    reporter.progress(0.5);
                    reporter.cancelled().await;
                    reporter.finish(Err(SyncError::Cancelled)).await;
                }
            }
        });

        Ok(transfer)
    }

    async fn is_busy(&self) -> SyncResult<bool> {
        Ok(self.busy.load(Ordering::SeqCst))
    }
}

// ── FakeDestination ──────────────────────────────────────────────

/// Destination answering with scripted outcomes, keyed by log id prefix
/// (`LOG0012`). Unscripted logs are accepted.
pub struct FakeDestination {
    config: DestinationConfig,
    outcomes: Mutex<HashMap<String, UploadOutcome>>,
    reachable: AtomicBool,
    unreadable: AtomicBool,
    submitted: Mutex<Vec<String>>,
    forms: Mutex<Vec<UploadForm>>,
    probes: AtomicUsize,
}

impl FakeDestination {
    pub fn new(id: DestinationId) -> Self {
        Self {
            config: DestinationConfig {
                id,
                base_url: "https://review.example".to_string(),
                email: "pilot@example.com".to_string(),
                public: false,
            },
            outcomes: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            unreadable: AtomicBool::new(false),
            submitted: Mutex::new(Vec::new()),
            forms: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, log_id: u32, outcome: UploadOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(format!("LOG{log_id:04}"), outcome);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes `submit` fail as if the local file could not be read.
    pub fn set_unreadable(&self, unreadable: bool) {
        self.unreadable.store(unreadable, Ordering::SeqCst);
    }

    /// File names submitted so far, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn forms(&self) -> Vec<UploadForm> {
        self.forms.lock().unwrap().clone()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn distinct_submitted(&self) -> HashSet<String> {
        self.submitted().into_iter().collect()
    }
}

#[async_trait]
impl UploadDestination for FakeDestination {
    fn descriptor(&self) -> &DestinationConfig {
        &self.config
    }

    async fn probe(&self) -> SyncResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Network("connection refused".to_string()))
        }
    }

    async fn submit(&self, path: &Path, form: &UploadForm) -> SyncResult<UploadOutcome> {
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("cannot read {}", path.display()),
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.submitted.lock().unwrap().push(name.clone());
        self.forms.lock().unwrap().push(form.clone());

        let outcomes = self.outcomes.lock().unwrap();
        let scripted = outcomes
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, outcome)| outcome.clone());
        Ok(scripted.unwrap_or_else(|| UploadOutcome::Uploaded {
            url: format!("{}/plot_app?log={name}", self.config.base_url),
        }))
    }
}
