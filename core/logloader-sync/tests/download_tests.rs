mod common;

use common::{eventually, log_a, log_b, FakeDevice, TransferScript};
use logloader_registry::LogRegistry;
use logloader_sync::{
    CycleReport, DownloadCoordinator, DownloadSettings, GateState, PauseGate, SyncError,
};
use logloader_types::{marker_path, DownloadState, LogEntry, LogRecord};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    device: Arc<FakeDevice>,
    registry: LogRegistry,
    gate: PauseGate,
    dir: TempDir,
    coordinator: DownloadCoordinator,
}

fn harness(entries: Vec<LogEntry>) -> Harness {
    let device = Arc::new(FakeDevice::with_entries(entries));
    let registry = LogRegistry::open_in_memory().unwrap();
    let gate = PauseGate::new();
    gate.set(GateState::Open);
    let dir = TempDir::new().unwrap();
    let coordinator = DownloadCoordinator::new(
        device.clone(),
        registry.clone(),
        gate.subscribe(),
        dir.path().to_path_buf(),
        DownloadSettings::default(),
    );
    Harness {
        device,
        registry,
        gate,
        dir,
        coordinator,
    }
}

impl Harness {
    fn record(&self, entry: &LogEntry) -> LogRecord {
        self.registry.lookup(&entry.fingerprint()).unwrap().unwrap()
    }

    fn path(&self, entry: &LogEntry) -> std::path::PathBuf {
        self.dir.path().join(entry.file_name())
    }
}

// ── Discovery and download ──────────────────────────────────────

#[tokio::test]
async fn new_logs_are_downloaded_most_recent_first() {
    let older = LogEntry::new(3, "2023-12-31T00:00:00Z", 200);
    let h = harness(vec![older.clone(), log_a(), log_b()]);

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        report,
        CycleReport {
            listed: 3,
            discovered: 3,
            downloaded: 3,
            ..CycleReport::default()
        }
    );
    assert_eq!(h.device.started(), vec![13, 12, 3]);

    for entry in [log_a(), log_b(), older] {
        let record = h.record(&entry);
        assert!(record.downloaded());
        let path = h.path(&entry);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            entry.size_bytes,
            "{}",
            path.display()
        );
        assert!(!marker_path(&path).exists());
    }
}

#[tokio::test]
async fn downloaded_logs_are_not_transferred_again() {
    let h = harness(vec![log_a()]);
    let shutdown = CancellationToken::new();

    h.coordinator.run_cycle(&shutdown).await.unwrap();
    let second = h.coordinator.run_cycle(&shutdown).await.unwrap();

    assert_eq!(second.listed, 1);
    assert_eq!(second.discovered, 0);
    assert_eq!(second.downloaded, 0);
    assert_eq!(h.device.started(), vec![12]);
    assert_eq!(h.registry.records().unwrap().len(), 1);
}

#[tokio::test]
async fn existing_partial_file_is_replaced() {
    let h = harness(vec![log_a()]);
    std::fs::write(h.path(&log_a()), b"stale partial data").unwrap();

    h.coordinator.run_cycle(&CancellationToken::new()).await.unwrap();

    let content = std::fs::read(h.path(&log_a())).unwrap();
    assert_eq!(content, vec![b'x'; 1000]);
}

#[tokio::test]
async fn empty_listing_is_a_quiet_cycle() {
    let h = harness(Vec::new());
    let report = h.coordinator.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(report, CycleReport::default());
}

// ── Failures ────────────────────────────────────────────────────

#[tokio::test]
async fn failed_transfer_does_not_block_older_logs() {
    let h = harness(vec![log_a(), log_b()]);
    h.device.script(13, TransferScript::Fail);

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.downloaded, 1);
    assert_eq!(h.device.started(), vec![13, 12]);

    let failed = h.record(&log_b());
    assert_eq!(failed.download_state, DownloadState::NotStarted);
    assert_eq!(failed.download_failures, 1);
    assert!(!marker_path(&h.path(&log_b())).exists());
    assert!(h.record(&log_a()).downloaded());
}

#[tokio::test]
async fn failed_transfer_is_retried_next_cycle() {
    let h = harness(vec![log_a()]);
    let shutdown = CancellationToken::new();
    h.device.script(12, TransferScript::Fail);
    h.coordinator.run_cycle(&shutdown).await.unwrap();

    h.device.script(12, TransferScript::Complete);
    let report = h.coordinator.run_cycle(&shutdown).await.unwrap();

    assert_eq!(report.downloaded, 1);
    let record = h.record(&log_a());
    assert!(record.downloaded());
    assert_eq!(record.download_failures, 1);
}

#[tokio::test]
async fn listing_failure_is_retryable() {
    let h = harness(vec![log_a()]);
    h.device.set_fail_listing(true);

    let err = h.coordinator.run_cycle(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, SyncError::Device(_)));
    assert!(err.is_retryable());
    assert!(h.registry.records().unwrap().is_empty());
}

#[tokio::test]
async fn failed_listing_is_retried_after_the_short_backoff() {
    let device = Arc::new(FakeDevice::with_entries(vec![log_a()]));
    device.set_fail_listing(true);
    let registry = LogRegistry::open_in_memory().unwrap();
    let gate = PauseGate::new();
    gate.set(GateState::Open);
    let dir = TempDir::new().unwrap();
    let coordinator = DownloadCoordinator::new(
        device.clone(),
        registry.clone(),
        gate.subscribe(),
        dir.path().to_path_buf(),
        DownloadSettings {
            interval: Duration::from_secs(3600),
            listing_retry: Duration::from_millis(50),
            ..DownloadSettings::default()
        },
    );

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(coordinator.run(shutdown.clone()));

    eventually(Duration::from_secs(5), || device.listings() >= 2).await;
    device.set_fail_listing(false);
    eventually(Duration::from_secs(5), || {
        registry
            .lookup(&log_a().fingerprint())
            .unwrap()
            .is_some_and(|r| r.downloaded())
    })
    .await;

    shutdown.cancel();
    run.await.unwrap();
}

// ── Listing misses ──────────────────────────────────────────────

#[tokio::test]
async fn vanished_log_is_given_up_after_repeated_misses() {
    let h = harness(vec![log_a()]);
    h.registry.upsert(&LogRecord::from_entry(&log_b())).unwrap();
    let shutdown = CancellationToken::new();

    let first = h.coordinator.run_cycle(&shutdown).await.unwrap();
    assert_eq!(first.missing, 1);
    assert_eq!(first.given_up, 0);
    assert_eq!(h.record(&log_b()).listing_misses, 1);

    let second = h.coordinator.run_cycle(&shutdown).await.unwrap();
    assert_eq!(second.missing, 1);

    let third = h.coordinator.run_cycle(&shutdown).await.unwrap();
    assert_eq!(third.missing, 0);
    assert_eq!(third.given_up, 1);

    let record = h.record(&log_b());
    assert!(record.downloaded());
    assert_eq!(record.listing_misses, 3);
    assert!(!h.device.started().contains(&13));
    assert!(!h.path(&log_b()).exists());
}

#[tokio::test]
async fn reappearing_log_resets_its_miss_count() {
    let h = harness(Vec::new());
    h.registry.upsert(&LogRecord::from_entry(&log_a())).unwrap();
    let shutdown = CancellationToken::new();

    h.coordinator.run_cycle(&shutdown).await.unwrap();
    h.coordinator.run_cycle(&shutdown).await.unwrap();
    assert_eq!(h.record(&log_a()).listing_misses, 2);

    h.device.set_entries(vec![log_a()]);
    let report = h.coordinator.run_cycle(&shutdown).await.unwrap();

    assert_eq!(report.downloaded, 1);
    let record = h.record(&log_a());
    assert!(record.downloaded());
    assert_eq!(record.listing_misses, 0);
}

// ── Gate and shutdown ───────────────────────────────────────────

#[tokio::test]
async fn closed_gate_registers_but_does_not_download() {
    let h = harness(vec![log_a()]);
    h.gate.set(GateState::Paused);

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.discovered, 1);
    assert_eq!(report.downloaded, 0);
    assert!(report.paused);
    assert!(h.device.started().is_empty());
    assert!(!h.record(&log_a()).downloaded());
}

#[tokio::test]
async fn downloads_resume_as_soon_as_gate_reopens() {
    let device = Arc::new(FakeDevice::with_entries(vec![log_a()]));
    device.set_listing_delay(Duration::from_millis(200));
    let registry = LogRegistry::open_in_memory().unwrap();
    let gate = PauseGate::new();
    gate.set(GateState::Open);
    let dir = TempDir::new().unwrap();
    let coordinator = DownloadCoordinator::new(
        device.clone(),
        registry.clone(),
        gate.subscribe(),
        dir.path().to_path_buf(),
        DownloadSettings {
            interval: Duration::from_secs(3600),
            ..DownloadSettings::default()
        },
    );

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(coordinator.run(shutdown.clone()));

    // The device goes busy while the first listing is in flight.
    eventually(Duration::from_secs(5), || device.listings() == 1).await;
    gate.set(GateState::Paused);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(device.started().is_empty());

    // Reopening must not wait for the hour-long cycle interval.
    gate.set(GateState::Open);
    eventually(Duration::from_secs(5), || {
        registry
            .lookup(&log_a().fingerprint())
            .unwrap()
            .is_some_and(|r| r.downloaded())
    })
    .await;

    shutdown.cancel();
    run.await.unwrap();
}

#[tokio::test]
async fn shutdown_cancels_in_flight_transfer() {
    let h = Arc::new(harness(vec![log_a()]));
    h.device.script(12, TransferScript::Hang);
    let shutdown = CancellationToken::new();

    let cycle = {
        let h = Arc::clone(&h);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { h.coordinator.run_cycle(&shutdown).await })
    };

    eventually(Duration::from_secs(5), || {
        h.record(&log_a()).download_state == DownloadState::InProgress
            && !h.device.started().is_empty()
    })
    .await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .expect("cycle did not stop")
        .unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)));

    let record = h.record(&log_a());
    assert_eq!(record.download_state, DownloadState::NotStarted);
    assert_eq!(record.download_failures, 0);
    assert!(!marker_path(&h.path(&log_a())).exists());
}

#[tokio::test]
async fn cancelled_before_listing_returns_cancelled() {
    let h = harness(vec![log_a()]);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let result = h.coordinator.run_cycle(&shutdown).await;
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert!(h.device.started().is_empty());
}
