use crate::baseline::BaselineEntry;
use crate::error::StoreError;
use crate::events::{ErrorReport, Fingerprint, HourBucket, RecordReceipt};
use crate::store::backend::{Delivery, ErrorDefinition, HourlyCount, StoreBackend};
use chrono::Utc;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed durable store
///
/// A single connection guarded by a mutex serializes writers, which makes the
/// increment-and-append of `record` atomic per key without lost updates.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database at `path`
    ///
    /// Creates parent directories, enables WAL mode and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        initialize_schema(&conn)?;

        info!("Opened aggregate store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Non-durable database, used by tests and dry runs
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS counters (
            version     TEXT    NOT NULL,
            fingerprint TEXT    NOT NULL,
            hour        INTEGER NOT NULL,
            count       INTEGER NOT NULL,
            PRIMARY KEY (version, fingerprint, hour)
        );

        CREATE INDEX IF NOT EXISTS idx_counters_fingerprint ON counters (fingerprint);

        CREATE TABLE IF NOT EXISTS samples (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            version     TEXT    NOT NULL,
            fingerprint TEXT    NOT NULL,
            hour        INTEGER NOT NULL,
            report      TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_samples_key ON samples (version, fingerprint, id);

        CREATE TABLE IF NOT EXISTS definitions (
            fingerprint TEXT PRIMARY KEY,
            definition  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS baselines (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            version      TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end   TEXT NOT NULL,
            entry        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_baselines_version
            ON baselines (version, window_start, window_end);

        CREATE TABLE IF NOT EXISTS deliveries (
            key        TEXT    PRIMARY KEY,
            expires_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_deliveries_expiry ON deliveries (expires_at);

        CREATE TABLE IF NOT EXISTS imported_hours (
            hour        INTEGER PRIMARY KEY,
            imported_at TEXT NOT NULL
        );",
    )
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Count one occurrence inside an open transaction
fn record_in(
    conn: &Connection,
    report: &ErrorReport,
    sample_limit: usize,
) -> Result<RecordReceipt, StoreError> {
    let sample_json = serde_json::to_string(report)?;
    let definition_json = serde_json::to_string(&ErrorDefinition::from_report(report))?;
    let fingerprint = report.fingerprint.as_str();
    let hour = report.bucket().0;

    let seen_before: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM counters WHERE fingerprint = ?1)",
        params![fingerprint],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO counters (version, fingerprint, hour, count) VALUES (?1, ?2, ?3, 1)
         ON CONFLICT (version, fingerprint, hour) DO UPDATE SET count = count + 1",
        params![report.version, fingerprint, hour],
    )?;

    let hour_count: i64 = conn.query_row(
        "SELECT count FROM counters WHERE version = ?1 AND fingerprint = ?2 AND hour = ?3",
        params![report.version, fingerprint, hour],
        |row| row.get(0),
    )?;

    let total_count: i64 = conn.query_row(
        "SELECT COALESCE(SUM(count), 0) FROM counters WHERE version = ?1 AND fingerprint = ?2",
        params![report.version, fingerprint],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO samples (version, fingerprint, hour, report) VALUES (?1, ?2, ?3, ?4)",
        params![report.version, fingerprint, hour, sample_json],
    )?;

    // Oldest samples go first; the counter is untouched
    conn.execute(
        "DELETE FROM samples WHERE version = ?1 AND fingerprint = ?2 AND id NOT IN (
            SELECT id FROM samples WHERE version = ?1 AND fingerprint = ?2
            ORDER BY id DESC LIMIT ?3
        )",
        params![report.version, fingerprint, to_limit(sample_limit)],
    )?;

    conn.execute(
        "INSERT INTO definitions (fingerprint, definition) VALUES (?1, ?2)
         ON CONFLICT (fingerprint) DO UPDATE SET definition = excluded.definition",
        params![fingerprint, definition_json],
    )?;

    Ok(RecordReceipt {
        hour_count: to_count(hour_count),
        total_count: to_count(total_count),
        first_seen: !seen_before,
    })
}

impl StoreBackend for SqliteBackend {
    fn record(
        &self,
        report: &ErrorReport,
        sample_limit: usize,
    ) -> Result<RecordReceipt, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let receipt = record_in(&tx, report, sample_limit)?;
        tx.commit()?;
        Ok(receipt)
    }

    fn record_delivery(
        &self,
        report: &ErrorReport,
        sample_limit: usize,
        delivery: &Delivery,
    ) -> Result<Option<RecordReceipt>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM deliveries WHERE expires_at <= ?1",
            params![delivery.received_at.timestamp()],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO deliveries (key, expires_at) VALUES (?1, ?2)",
            params![delivery.key, delivery.expires_at.timestamp()],
        )?;

        let receipt = if inserted > 0 {
            Some(record_in(&tx, report, sample_limit)?)
        } else {
            debug!("Delivery {} already recorded", delivery.key);
            None
        };
        tx.commit()?;
        Ok(receipt)
    }

    fn count(
        &self,
        version: &str,
        fingerprint: &Fingerprint,
        first: HourBucket,
        last: HourBucket,
    ) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(count), 0) FROM counters
             WHERE version = ?1 AND fingerprint = ?2 AND hour >= ?3 AND hour <= ?4",
            params![version, fingerprint.as_str(), first.0, last.0],
            |row| row.get(0),
        )?;
        Ok(to_count(total))
    }

    fn fingerprint_counts(
        &self,
        version: &str,
        first: HourBucket,
        last: HourBucket,
    ) -> Result<Vec<(Fingerprint, u64)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT fingerprint, SUM(count) AS total FROM counters
             WHERE version = ?1 AND hour >= ?2 AND hour <= ?3
             GROUP BY fingerprint
             ORDER BY total DESC, fingerprint ASC",
        )?;

        let rows = stmt
            .query_map(params![version, first.0, last.0], |row| {
                Ok((Fingerprint::new(row.get::<_, String>(0)?), row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(fingerprint, total)| (fingerprint, to_count(total)))
            .collect())
    }

    fn samples(
        &self,
        version: &str,
        fingerprint: &Fingerprint,
        limit: usize,
    ) -> Result<Vec<ErrorReport>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT report FROM samples WHERE version = ?1 AND fingerprint = ?2
             ORDER BY id DESC LIMIT ?3",
        )?;

        let raw = stmt
            .query_map(
                params![version, fingerprint.as_str(), to_limit(limit)],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    fn definition(&self, fingerprint: &Fingerprint) -> Result<Option<ErrorDefinition>, StoreError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT definition FROM definitions WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    fn history(&self, fingerprint: &Fingerprint) -> Result<Vec<HourlyCount>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT version, hour, count FROM counters WHERE fingerprint = ?1
             ORDER BY hour ASC, version ASC",
        )?;

        let rows = stmt
            .query_map(params![fingerprint.as_str()], |row| {
                Ok(HourlyCount {
                    version: row.get(0)?,
                    bucket: HourBucket(row.get(1)?),
                    count: to_count(row.get(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn save_baseline(&self, entry: &BaselineEntry) -> Result<i64, StoreError> {
        // The row id is authoritative; the serialized id is patched on read
        let json = serde_json::to_string(entry)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO baselines (version, window_start, window_end, entry)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.version,
                entry.window.start.to_rfc3339(),
                entry.window.end.to_rfc3339(),
                json,
            ],
        )?;
        let id = conn.last_insert_rowid();

        debug!("Saved baseline {} for version {}", id, entry.version);
        Ok(id)
    }

    fn baselines(&self, version: &str) -> Result<Vec<BaselineEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, entry FROM baselines WHERE version = ?1 ORDER BY id ASC")?;

        let rows = stmt
            .query_map(params![version], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, json)| -> Result<BaselineEntry, StoreError> {
                let mut entry: BaselineEntry = serde_json::from_str(&json)?;
                entry.id = id;
                Ok(entry)
            })
            .collect()
    }

    fn mark_hour_imported(&self, bucket: HourBucket) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO imported_hours (hour, imported_at) VALUES (?1, ?2)",
            params![bucket.0, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    fn hour_imported(&self, bucket: HourBucket) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM imported_hours WHERE hour = ?1)",
            params![bucket.0],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn prune(&self, before: HourBucket) -> Result<u64, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let counters = tx.execute("DELETE FROM counters WHERE hour < ?1", params![before.0])?;
        let samples = tx.execute("DELETE FROM samples WHERE hour < ?1", params![before.0])?;
        tx.execute(
            "DELETE FROM deliveries WHERE expires_at <= ?1",
            params![before.start().timestamp()],
        )?;
        tx.commit()?;
        Ok((counters + samples) as u64)
    }

    fn ping(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .optional()?;
        Ok(())
    }
}
