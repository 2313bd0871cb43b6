//! SQLite store for log records, per-destination upload state and the denylist.

use crate::error::{RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use logloader_types::{DenylistEntry, DestinationId, DownloadState, Fingerprint, LogRecord};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const RECORD_COLUMNS: &str =
    "fingerprint, id, date, size_bytes, download_state, download_failures, listing_misses";

/// Persistent registry of discovered logs backed by SQLite.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct LogRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl LogRegistry {
    /// Opens (or creates) a registry at the given path.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        let conn = Connection::open(path)?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.init_schema()?;
        debug!("opened log registry at {}", path.display());
        Ok(registry)
    }

    /// Opens an in-memory registry (for testing).
    pub fn open_in_memory() -> RegistryResult<Self> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    fn conn(&self) -> RegistryResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RegistryError::Poisoned)
    }

    fn init_schema(&self) -> RegistryResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS logs (
                fingerprint TEXT PRIMARY KEY,
                id INTEGER NOT NULL,
                date TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                download_state TEXT NOT NULL DEFAULT 'not_started',
                download_failures INTEGER NOT NULL DEFAULT 0,
                listing_misses INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS logs_by_recency ON logs (date DESC, size_bytes DESC);

            CREATE TABLE IF NOT EXISTS uploads (
                fingerprint TEXT NOT NULL REFERENCES logs (fingerprint),
                destination TEXT NOT NULL,
                PRIMARY KEY (fingerprint, destination)
            );

            CREATE TABLE IF NOT EXISTS denylist (
                fingerprint TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Records ──────────────────────────────────────────────────

    /// Inserts a record if its fingerprint is unknown.
    ///
    /// Returns `true` if a new record was created. An existing record is left
    /// untouched, including its download and upload state.
    pub fn upsert(&self, record: &LogRecord) -> RegistryResult<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO logs (fingerprint, id, date, size_bytes, download_state, download_failures, listing_misses)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.fingerprint.as_str(),
                record.id,
                record.date,
                to_sql_size(record.size_bytes)?,
                record.download_state.as_str(),
                record.download_failures,
                record.listing_misses,
            ],
        )?;
        if inserted > 0 {
            debug!("registered log {} ({})", record.fingerprint, record.file_name());
        }
        Ok(inserted > 0)
    }

    /// Looks up a record by fingerprint.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> RegistryResult<Option<LogRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM logs WHERE fingerprint = ?1"),
                params![fingerprint.as_str()],
                RawRecord::from_row,
            )
            .optional()?;
        row.map(|raw| raw.into_record(&conn)).transpose()
    }

    /// Returns every record, most recent first.
    pub fn records(&self) -> RegistryResult<Vec<LogRecord>> {
        let conn = self.conn()?;
        let raws = query_records(
            &conn,
            &format!("SELECT {RECORD_COLUMNS} FROM logs ORDER BY date DESC, size_bytes DESC"),
            params![],
        )?;
        raws.into_iter().map(|raw| raw.into_record(&conn)).collect()
    }

    // ── Download state ───────────────────────────────────────────

    /// Marks a log as downloaded (`Complete`) or not (`NotStarted`).
    pub fn set_downloaded(&self, fingerprint: &Fingerprint, downloaded: bool) -> RegistryResult<()> {
        let state = if downloaded {
            DownloadState::Complete
        } else {
            DownloadState::NotStarted
        };
        self.set_download_state(fingerprint, state)
    }

    /// Sets the download lifecycle state of a log.
    pub fn set_download_state(
        &self,
        fingerprint: &Fingerprint,
        state: DownloadState,
    ) -> RegistryResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE logs SET download_state = ?1 WHERE fingerprint = ?2",
            params![state.as_str(), fingerprint.as_str()],
        )?;
        require_changed(changed, fingerprint)
    }

    /// Returns the most recent log that still needs downloading.
    pub fn next_to_download(&self) -> RegistryResult<Option<LogRecord>> {
        self.next_to_download_excluding(&HashSet::new())
    }

    /// Like [`next_to_download`](Self::next_to_download), skipping the given fingerprints.
    pub fn next_to_download_excluding(
        &self,
        exclude: &HashSet<Fingerprint>,
    ) -> RegistryResult<Option<LogRecord>> {
        let conn = self.conn()?;
        let raws = query_records(
            &conn,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM logs
                 WHERE download_state != 'complete'
                 ORDER BY date DESC, size_bytes DESC"
            ),
            params![],
        )?;
        first_not_excluded(&conn, raws, exclude)
    }

    /// Number of logs that still need downloading.
    pub fn pending_download_count(&self) -> RegistryResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM logs WHERE download_state != 'complete'",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Counts a failed transfer and returns the log to `NotStarted`.
    ///
    /// Returns the updated failure count.
    pub fn record_download_failure(&self, fingerprint: &Fingerprint) -> RegistryResult<u32> {
        let conn = self.conn()?;
        let failures = conn
            .query_row(
                "UPDATE logs
                 SET download_failures = download_failures + 1, download_state = 'not_started'
                 WHERE fingerprint = ?1
                 RETURNING download_failures",
                params![fingerprint.as_str()],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        failures.ok_or_else(|| RegistryError::UnknownLog(fingerprint.clone()))
    }

    /// Counts a listing in which a pending log was absent. Returns the new count.
    pub fn record_listing_miss(&self, fingerprint: &Fingerprint) -> RegistryResult<u32> {
        let conn = self.conn()?;
        let misses = conn
            .query_row(
                "UPDATE logs SET listing_misses = listing_misses + 1
                 WHERE fingerprint = ?1
                 RETURNING listing_misses",
                params![fingerprint.as_str()],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        misses.ok_or_else(|| RegistryError::UnknownLog(fingerprint.clone()))
    }

    /// Clears the listing-miss counter of a log that was seen again.
    pub fn reset_listing_misses(&self, fingerprint: &Fingerprint) -> RegistryResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE logs SET listing_misses = 0 WHERE fingerprint = ?1",
            params![fingerprint.as_str()],
        )?;
        require_changed(changed, fingerprint)
    }

    /// Resets every interrupted download back to `NotStarted`.
    ///
    /// Called once at startup. Returns the records that were reset, so their
    /// partial files can be cleaned up.
    pub fn recover_interrupted(&self) -> RegistryResult<Vec<LogRecord>> {
        let conn = self.conn()?;
        let raws = query_records(
            &conn,
            &format!("SELECT {RECORD_COLUMNS} FROM logs WHERE download_state = 'in_progress'"),
            params![],
        )?;
        conn.execute(
            "UPDATE logs SET download_state = 'not_started' WHERE download_state = 'in_progress'",
            [],
        )?;
        let mut recovered = Vec::with_capacity(raws.len());
        for raw in raws {
            let mut record = raw.into_record(&conn)?;
            record.download_state = DownloadState::NotStarted;
            recovered.push(record);
        }
        if !recovered.is_empty() {
            info!("recovered {} interrupted download(s)", recovered.len());
        }
        Ok(recovered)
    }

    // ── Upload state ─────────────────────────────────────────────

    /// Sets or clears the uploaded flag of a log for one destination.
    pub fn set_uploaded(
        &self,
        fingerprint: &Fingerprint,
        destination: &DestinationId,
        uploaded: bool,
    ) -> RegistryResult<()> {
        let conn = self.conn()?;
        let known: i64 = conn.query_row(
            "SELECT COUNT(*) FROM logs WHERE fingerprint = ?1",
            params![fingerprint.as_str()],
            |row| row.get(0),
        )?;
        if known == 0 {
            return Err(RegistryError::UnknownLog(fingerprint.clone()));
        }
        if uploaded {
            conn.execute(
                "INSERT OR IGNORE INTO uploads (fingerprint, destination) VALUES (?1, ?2)",
                params![fingerprint.as_str(), destination.as_str()],
            )?;
        } else {
            conn.execute(
                "DELETE FROM uploads WHERE fingerprint = ?1 AND destination = ?2",
                params![fingerprint.as_str(), destination.as_str()],
            )?;
        }
        Ok(())
    }

    /// Returns the most recent downloaded log not yet uploaded to `destination`
    /// and not denylisted.
    pub fn next_to_upload(&self, destination: &DestinationId) -> RegistryResult<Option<LogRecord>> {
        self.next_to_upload_excluding(destination, &HashSet::new())
    }

    /// Like [`next_to_upload`](Self::next_to_upload), skipping the given fingerprints.
    pub fn next_to_upload_excluding(
        &self,
        destination: &DestinationId,
        exclude: &HashSet<Fingerprint>,
    ) -> RegistryResult<Option<LogRecord>> {
        let conn = self.conn()?;
        let raws = query_records(
            &conn,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM logs
                 WHERE {UPLOAD_ELIGIBLE}
                 ORDER BY date DESC, size_bytes DESC"
            ),
            params![destination.as_str()],
        )?;
        first_not_excluded(&conn, raws, exclude)
    }

    /// Number of logs waiting to be uploaded to `destination`.
    pub fn pending_upload_count(&self, destination: &DestinationId) -> RegistryResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM logs WHERE {UPLOAD_ELIGIBLE}"),
            params![destination.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    // ── Denylist ─────────────────────────────────────────────────

    /// Permanently excludes a log from uploads to every destination.
    ///
    /// The first recorded reason is kept if the log is already denylisted.
    pub fn add_to_denylist(&self, fingerprint: &Fingerprint, reason: &str) -> RegistryResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO denylist (fingerprint, reason, recorded_at) VALUES (?1, ?2, ?3)",
            params![fingerprint.as_str(), reason, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Returns true if the log has been denylisted.
    pub fn is_denylisted(&self, fingerprint: &Fingerprint) -> RegistryResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM denylist WHERE fingerprint = ?1",
            params![fingerprint.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Returns the denylist entry of a log, if any.
    pub fn denylist_entry(&self, fingerprint: &Fingerprint) -> RegistryResult<Option<DenylistEntry>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT fingerprint, reason, recorded_at FROM denylist WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(fp, reason, recorded_at)| decode_denylist(&fp, reason, &recorded_at))
            .transpose()
    }
}

/// Shared filter for upload candidates; `?1` is the destination name.
const UPLOAD_ELIGIBLE: &str = "download_state = 'complete'
    AND NOT EXISTS (SELECT 1 FROM uploads u WHERE u.fingerprint = logs.fingerprint AND u.destination = ?1)
    AND NOT EXISTS (SELECT 1 FROM denylist d WHERE d.fingerprint = logs.fingerprint)";

// ── Row decoding ─────────────────────────────────────────────────

struct RawRecord {
    fingerprint: String,
    id: u32,
    date: String,
    size_bytes: i64,
    download_state: String,
    download_failures: u32,
    listing_misses: u32,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: row.get(0)?,
            id: row.get(1)?,
            date: row.get(2)?,
            size_bytes: row.get(3)?,
            download_state: row.get(4)?,
            download_failures: row.get(5)?,
            listing_misses: row.get(6)?,
        })
    }

    fn into_record(self, conn: &Connection) -> RegistryResult<LogRecord> {
        let fingerprint = Fingerprint::parse(&self.fingerprint)
            .map_err(|e| RegistryError::InvalidData(format!("fingerprint: {e}")))?;
        let download_state = self
            .download_state
            .parse::<DownloadState>()
            .map_err(|e| RegistryError::InvalidData(e.to_string()))?;
        let size_bytes = u64::try_from(self.size_bytes).map_err(|_| {
            RegistryError::InvalidData(format!("negative size for {}", self.fingerprint))
        })?;
        let uploaded_to = uploaded_destinations(conn, &fingerprint)?;

        Ok(LogRecord {
            fingerprint,
            id: self.id,
            date: self.date,
            size_bytes,
            download_state,
            uploaded_to,
            download_failures: self.download_failures,
            listing_misses: self.listing_misses,
        })
    }
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> RegistryResult<Vec<RawRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, RawRecord::from_row)?;
    let mut raws = Vec::new();
    for row in rows {
        raws.push(row?);
    }
    Ok(raws)
}

fn first_not_excluded(
    conn: &Connection,
    raws: Vec<RawRecord>,
    exclude: &HashSet<Fingerprint>,
) -> RegistryResult<Option<LogRecord>> {
    for raw in raws {
        let record = raw.into_record(conn)?;
        if !exclude.contains(&record.fingerprint) {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

fn uploaded_destinations(
    conn: &Connection,
    fingerprint: &Fingerprint,
) -> RegistryResult<BTreeSet<DestinationId>> {
    let mut stmt = conn.prepare("SELECT destination FROM uploads WHERE fingerprint = ?1")?;
    let rows = stmt.query_map(params![fingerprint.as_str()], |row| row.get::<_, String>(0))?;
    let mut destinations = BTreeSet::new();
    for row in rows {
        let name = row?;
        let id = DestinationId::parse(&name)
            .map_err(|e| RegistryError::InvalidData(format!("destination: {e}")))?;
        destinations.insert(id);
    }
    Ok(destinations)
}

fn decode_denylist(fp: &str, reason: String, recorded_at: &str) -> RegistryResult<DenylistEntry> {
    let fingerprint = Fingerprint::parse(fp)
        .map_err(|e| RegistryError::InvalidData(format!("fingerprint: {e}")))?;
    let recorded_at = DateTime::parse_from_rfc3339(recorded_at)
        .map_err(|e| RegistryError::InvalidData(format!("recorded_at: {e}")))?
        .with_timezone(&Utc);
    Ok(DenylistEntry {
        fingerprint,
        reason,
        recorded_at,
    })
}

fn to_sql_size(size_bytes: u64) -> RegistryResult<i64> {
    i64::try_from(size_bytes)
        .map_err(|_| RegistryError::InvalidData(format!("size {size_bytes} out of range")))
}

fn require_changed(changed: usize, fingerprint: &Fingerprint) -> RegistryResult<()> {
    if changed == 0 {
        return Err(RegistryError::UnknownLog(fingerprint.clone()));
    }
    Ok(())
}
