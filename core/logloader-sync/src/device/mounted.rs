//! Device link for log storage mounted as a filesystem.
//!
//! Covers SD card readers, USB mass storage and network shares exposing the
//! flight controller's log directory. Logs live either directly under the
//! root or in per-day folders (`2024-01-01/12_30_00.ulg`).

use super::{DeviceLink, Transfer, TransferReporter};
use crate::config::DeviceConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use logloader_types::LogEntry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const LOG_EXTENSION: &str = "ulg";

/// Filesystem-backed device link.
pub struct MountedStorageLink {
    config: DeviceConfig,
    /// Paths from the latest listing, by entry id.
    listing: Arc<RwLock<HashMap<u32, PathBuf>>>,
}

impl MountedStorageLink {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            listing: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn collect_logs(&self) -> SyncResult<Vec<PathBuf>> {
        let mut logs = Vec::new();
        let mut pending = vec![self.config.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = fs::read_dir(&dir).await.map_err(|e| {
                SyncError::Device(format!("failed to read {}: {e}", dir.display()))
            })?;

            while let Some(entry) = read_dir.next_entry().await.map_err(|e| {
                SyncError::Device(format!("failed to read directory entry: {e}"))
            })? {
                let path = entry.path();
                if is_hidden(&path) {
                    continue;
                }
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Skipping {}: {e}", path.display());
                        continue;
                    }
                };
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == LOG_EXTENSION) {
                    logs.push(path);
                }
            }
        }

        logs.sort();
        Ok(logs)
    }

    fn busy_marker(&self) -> Option<PathBuf> {
        self.config
            .busy_marker
            .as_ref()
            .map(|marker| self.config.root.join(marker))
    }
}

#[async_trait]
impl DeviceLink for MountedStorageLink {
    fn describe(&self) -> String {
        format!("mounted storage at {}", self.config.root.display())
    }

    async fn connect(&self) -> SyncResult<()> {
        let metadata = fs::metadata(&self.config.root).await.map_err(|e| {
            SyncError::Device(format!("{} unavailable: {e}", self.config.root.display()))
        })?;
        if !metadata.is_dir() {
            return Err(SyncError::Device(format!(
                "{} is not a directory",
                self.config.root.display()
            )));
        }
        Ok(())
    }

    async fn list_entries(&self) -> SyncResult<Vec<LogEntry>> {
        let paths = self.collect_logs().await?;
        let mut entries = Vec::with_capacity(paths.len());
        let mut listing = HashMap::with_capacity(paths.len());

        for path in paths {
            let metadata = match fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping {}: {e}", path.display());
                    continue;
                }
            };
            let id = u32::try_from(entries.len())
                .map_err(|_| SyncError::Device("too many logs on device".to_string()))?;
            let date = date_from_layout(&path)
                .unwrap_or_else(|| format_date(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
            entries.push(LogEntry::new(id, date, metadata.len()));
            listing.insert(id, path);
        }

        *self.listing.write().await = listing;
        Ok(entries)
    }

    async fn begin_transfer(&self, entry: &LogEntry, destination: &Path) -> SyncResult<Transfer> {
        let source = self
            .listing
            .read()
            .await
            .get(&entry.id)
            .cloned()
            .ok_or_else(|| SyncError::Device(format!("log {} not in the current listing", entry.id)))?;

        let (reporter, transfer) = Transfer::channel();
        let destination = destination.to_path_buf();
        let size = entry.size_bytes;
        let chunk_size = self.config.chunk_size;

        tokio::spawn(async move {
            debug!("Copying {} to {}", source.display(), destination.display());
            let result = copy_with_progress(&source, &destination, size, chunk_size, &reporter).await;
            reporter.finish(result).await;
        });

        Ok(transfer)
    }

    async fn is_busy(&self) -> SyncResult<bool> {
        match self.busy_marker() {
            Some(marker) => Ok(fs::try_exists(&marker).await?),
            None => Ok(false),
        }
    }
}

async fn copy_with_progress(
    source: &Path,
    destination: &Path,
    size: u64,
    chunk_size: usize,
    reporter: &TransferReporter,
) -> SyncResult<()> {
    if reporter.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    // Only the snapshot that was listed; the device may still be appending.
    let mut input = fs::File::open(source).await?.take(size);
    let mut output = fs::File::create(destination).await?;
    let mut buf = vec![0u8; chunk_size];
    let mut copied: u64 = 0;

    loop {
        if reporter.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n]).await?;
        copied += n as u64;
        if size > 0 {
            reporter.progress(copied as f32 / size as f32);
        }
    }

    if copied < size {
        return Err(SyncError::Device(format!(
            "{} shrank to {copied} bytes, listed as {size}",
            source.display()
        )));
    }

    output.flush().await?;
    output.sync_all().await?;
    reporter.progress(1.0);
    Ok(())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

/// Derives the log date from a `YYYY-MM-DD/HH_MM_SS.ulg` path.
fn date_from_layout(path: &Path) -> Option<String> {
    let day = path.parent()?.file_name()?.to_str()?;
    let time = path.file_stem()?.to_str()?;
    let day = NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H_%M_%S").ok()?;
    Some(day.and_time(time).format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

fn format_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_from_px4_layout() {
        let path = Path::new("/mnt/log/2024-01-01/12_30_05.ulg");
        assert_eq!(date_from_layout(path).as_deref(), Some("2024-01-01T12:30:05Z"));
    }

    #[test]
    fn date_from_flat_layout_is_none() {
        assert!(date_from_layout(Path::new("/mnt/log/log001.ulg")).is_none());
    }

    #[test]
    fn epoch_formats_as_utc() {
        assert_eq!(format_date(SystemTime::UNIX_EPOCH), "1970-01-01T00:00:00Z");
    }
}
