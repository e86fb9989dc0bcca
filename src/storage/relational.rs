//! Relational (SQLite) profile store.
//!
//! One row per profile keyed by `request_id`, with the columns the
//! aggregate queries need broken out and the full document kept as JSON.
//! Rows persist until `purge` deletes those older than the retention
//! window.
//!
//! Writes go through one connection and reads through another, so a slow
//! dashboard query never holds up `put` (file databases run in WAL mode).
//! Waiting for either connection is bounded by `SQLITE_BUSY_TIMEOUT_MS`;
//! a store that cannot get one in time reports `BackendUnavailable`.

use super::{degrade, fill_buckets, retention_cutoff, ProfileStore, SummaryStats, TimeBucket};
use crate::model::schema::Profile;
use crate::utils::clock::{epoch_seconds, Clock};
use crate::utils::config::{MIN_HTTP_STATUS, SQLITE_BUSY_TIMEOUT_MS, SUMMARY_LATEST_LIMIT};
use crate::utils::error::StoreError;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Instant;

const LOCK_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS profiles (
        request_id TEXT PRIMARY KEY,
        endpoint_name TEXT NOT NULL,
        method TEXT NOT NULL,
        path TEXT NOT NULL,
        status INTEGER NOT NULL,
        started_at REAL NOT NULL,
        duration REAL NOT NULL,
        db_time REAL NOT NULL,
        view_time REAL NOT NULL,
        controller_time REAL NOT NULL,
        ruby_time REAL NOT NULL,
        query_count INTEGER NOT NULL,
        total_query_time REAL NOT NULL,
        data TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_profiles_started_at ON profiles(started_at);
    CREATE INDEX IF NOT EXISTS idx_profiles_endpoint ON profiles(endpoint_name, started_at);
";

struct Connections {
    writer: Mutex<Connection>,
    /// Read-only connection; `None` for in-memory databases, which
    /// cannot be opened twice
    reader: Option<Mutex<Connection>>,
}

/// Profile store backed by a SQLite database
pub struct SqliteStore {
    conns: Result<Connections, String>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    ///
    /// # Errors
    /// `StoreError::Sqlite` if the file cannot be opened or the schema
    /// cannot be created
    pub fn open(
        path: impl AsRef<Path>,
        retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::BackendUnavailable(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let writer = Connection::open(path)?;
        writer.execute_batch("PRAGMA journal_mode=WAL;")?;
        let writer = Self::prepare_writer(writer)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(std::time::Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
        debug!("[profiler] Opened reader connection to {}", path.display());

        Ok(Self::with_connections(writer, Some(reader), retention, clock))
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory(retention: Duration, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let writer = Self::prepare_writer(Connection::open_in_memory()?)?;
        Ok(Self::with_connections(writer, None, retention, clock))
    }

    fn prepare_writer(conn: Connection) -> Result<Connection, StoreError> {
        conn.busy_timeout(std::time::Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
        conn.execute_batch(SCHEMA)?;
        debug!("[profiler] SQLite schema ready");
        Ok(conn)
    }

    fn with_connections(
        writer: Connection,
        reader: Option<Connection>,
        retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conns: Ok(Connections {
                writer: Mutex::new(writer),
                reader: reader.map(Mutex::new),
            }),
            retention,
            clock,
        }
    }

    /// A store with no database behind it; every read is empty
    pub fn unavailable(reason: String, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            conns: Err(reason),
            retention,
            clock,
        }
    }

    fn connections(&self) -> Result<&Connections, StoreError> {
        self.conns
            .as_ref()
            .map_err(|reason| StoreError::BackendUnavailable(reason.clone()))
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        lock_bounded(&self.connections()?.writer, "writer")
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        let conns = self.connections()?;
        match &conns.reader {
            Some(reader) => lock_bounded(reader, "reader"),
            None => lock_bounded(&conns.writer, "writer"),
        }
    }

    fn try_put(&self, profile: &Profile) -> Result<(), StoreError> {
        let data = serde_json::to_string(profile)?;
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO profiles (
                request_id, endpoint_name, method, path, status, started_at,
                duration, db_time, view_time, controller_time, ruby_time,
                query_count, total_query_time, data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(request_id) DO UPDATE SET
                endpoint_name = excluded.endpoint_name,
                method = excluded.method,
                path = excluded.path,
                status = excluded.status,
                started_at = excluded.started_at,
                duration = excluded.duration,
                db_time = excluded.db_time,
                view_time = excluded.view_time,
                controller_time = excluded.controller_time,
                ruby_time = excluded.ruby_time,
                query_count = excluded.query_count,
                total_query_time = excluded.total_query_time,
                data = excluded.data",
            params![
                profile.request_id,
                profile.endpoint_name,
                profile.method,
                profile.path,
                profile.status,
                profile.started_at,
                profile.duration,
                profile.db_time,
                profile.view_time,
                profile.controller_time,
                profile.ruby_time,
                profile.query_count as i64,
                profile.total_query_time,
                data,
            ],
        )?;
        Ok(())
    }

    fn decode(request_id: &str, data: &str) -> Result<Profile, StoreError> {
        serde_json::from_str(data).map_err(|source| StoreError::MalformedRecord {
            request_id: request_id.to_string(),
            source,
        })
    }

    fn try_get(&self, request_id: &str) -> Result<Option<Profile>, StoreError> {
        let conn = self.reader()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM profiles WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|data| Self::decode(request_id, &data)).transpose()
    }

    /// Decode `(request_id, data)` rows, skipping malformed ones
    fn decode_rows(rows: Vec<(String, String)>) -> Vec<Profile> {
        rows.into_iter()
            .filter_map(|(request_id, data)| match Self::decode(&request_id, &data) {
                Ok(profile) => Some(profile),
                Err(e) => {
                    warn!("[profiler] Skipping record: {}", e);
                    None
                }
            })
            .collect()
    }

    fn try_list(&self, limit: usize, offset: usize) -> Result<Vec<Profile>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT request_id, data FROM profiles
             WHERE status >= ?1
             ORDER BY started_at DESC, request_id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                params![MIN_HTTP_STATUS, limit as i64, offset as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(Self::decode_rows(rows))
    }

    fn try_list_by_endpoint(
        &self,
        endpoint_name: &str,
        limit: usize,
    ) -> Result<Vec<Profile>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT request_id, data FROM profiles
             WHERE status >= ?1 AND endpoint_name = ?2
             ORDER BY started_at DESC, request_id DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![MIN_HTTP_STATUS, endpoint_name, limit as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(Self::decode_rows(rows))
    }

    fn try_count(&self) -> Result<u64, StoreError> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM profiles WHERE status >= ?1",
            params![MIN_HTTP_STATUS],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Aggregate per bucket in SQL, then merge into the zero-filled series
    fn try_time_series(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Result<Vec<TimeBucket>, StoreError> {
        let mut buckets = fill_buckets(start, end, interval, std::iter::empty());
        if buckets.is_empty() {
            return Ok(buckets);
        }

        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT (CAST(started_at AS INTEGER) / ?4) * ?4 AS bucket,
                    COUNT(*), SUM(duration), SUM(query_count), SUM(total_query_time)
             FROM profiles
             WHERE status >= ?1 AND started_at >= ?2 AND started_at < ?3
             GROUP BY bucket
             ORDER BY bucket",
        )?;
        let rows = stmt
            .query_map(
                params![
                    MIN_HTTP_STATUS,
                    epoch_seconds(start),
                    epoch_seconds(end),
                    interval.num_seconds()
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, f64>(4)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        for (timestamp, count, total_duration, query_count, query_time) in rows {
            match buckets.binary_search_by_key(&timestamp, |b| b.timestamp) {
                Ok(idx) => {
                    let bucket = &mut buckets[idx];
                    bucket.count = count.max(0) as u64;
                    bucket.total_duration = total_duration;
                    bucket.total_query_count = query_count.max(0) as u64;
                    bucket.total_query_time = query_time;
                    bucket.refresh_averages();
                }
                Err(_) => debug!("[profiler] Bucket {} outside series, ignoring", timestamp),
            }
        }
        Ok(buckets)
    }

    fn try_summary(&self) -> Result<SummaryStats, StoreError> {
        let mut stats = {
            let conn = self.reader()?;
            conn.query_row(
                "SELECT COUNT(*), AVG(duration), AVG(query_count), AVG(total_query_time),
                        AVG(db_time), AVG(view_time), AVG(controller_time), AVG(ruby_time)
                 FROM profiles WHERE status >= ?1",
                params![MIN_HTTP_STATUS],
                |row| {
                    Ok(SummaryStats {
                        total_count: row.get::<_, i64>(0)?.max(0) as u64,
                        avg_duration: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                        avg_query_count: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                        avg_query_time: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                        avg_db_time: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                        avg_view_time: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                        avg_controller_time: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                        avg_ruby_time: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
                        latest: Vec::new(),
                    })
                },
            )?
        };
        stats.latest = self.try_list(SUMMARY_LATEST_LIMIT, 0)?;
        Ok(stats)
    }

    fn try_purge(&self) -> Result<usize, StoreError> {
        let Some(cutoff) = retention_cutoff(self.clock.now(), self.retention) else {
            return Ok(0);
        };
        let conn = self.writer()?;
        let deleted = conn.execute(
            "DELETE FROM profiles WHERE started_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

/// Lock `mutex`, giving up after `SQLITE_BUSY_TIMEOUT_MS`
fn lock_bounded<'a>(
    mutex: &'a Mutex<Connection>,
    role: &str,
) -> Result<MutexGuard<'a, Connection>, StoreError> {
    let deadline = Instant::now() + std::time::Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS);
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => {
                return Err(StoreError::BackendUnavailable(format!(
                    "{} connection poisoned",
                    role
                )))
            }
            Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                return Err(StoreError::BackendUnavailable(format!(
                    "{} connection busy for {}ms",
                    role, SQLITE_BUSY_TIMEOUT_MS
                )))
            }
            Err(TryLockError::WouldBlock) => std::thread::sleep(LOCK_RETRY_INTERVAL),
        }
    }
}

impl ProfileStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "relational"
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn put(&self, profile: &Profile) {
        match self.try_put(profile) {
            Ok(()) if !profile.is_listable() => debug!(
                "[profiler] Profile {} has status {}, stored but not listed",
                profile.request_id, profile.status
            ),
            Ok(()) => {}
            Err(e) => warn!(
                "[profiler] Dropping profile {} (relational store): {}",
                profile.request_id, e
            ),
        }
    }

    fn get(&self, request_id: &str) -> Option<Profile> {
        match self.try_get(request_id) {
            Ok(profile) => profile,
            Err(e) => {
                warn!("[profiler] relational store get {} failed: {}", request_id, e);
                None
            }
        }
    }

    fn list(&self, limit: usize, offset: usize) -> Vec<Profile> {
        degrade("relational", "list", self.try_list(limit, offset))
    }

    fn list_by_endpoint(&self, endpoint_name: &str, limit: usize) -> Vec<Profile> {
        degrade(
            "relational",
            "list_by_endpoint",
            self.try_list_by_endpoint(endpoint_name, limit),
        )
    }

    fn count(&self) -> u64 {
        degrade("relational", "count", self.try_count())
    }

    fn time_series(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Vec<TimeBucket> {
        match self.try_time_series(start, end, interval) {
            Ok(buckets) => buckets,
            Err(e) => {
                warn!("[profiler] relational store time_series failed: {}", e);
                fill_buckets(start, end, interval, std::iter::empty())
            }
        }
    }

    fn summary_stats(&self) -> SummaryStats {
        degrade("relational", "summary_stats", self.try_summary())
    }

    fn purge(&self) -> usize {
        let deleted = degrade("relational", "purge", self.try_purge());
        info!("[profiler] relational store purge deleted {} rows", deleted);
        deleted
    }
}
