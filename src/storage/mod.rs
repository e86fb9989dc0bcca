//! Profile persistence.
//!
//! `ProfileStore` is the one storage contract the rest of the crate sees.
//! Two implementations exist, chosen once at configure time:
//! - `TtlStore`: key-value records that expire, plus a sorted time index
//! - `SqliteStore`: indexed rows with SQL aggregation and explicit purge
//!
//! Both expose identical read semantics. Neither ever returns a backend
//! failure to its caller: reads degrade to empty/zero results and writes
//! to logged no-ops.

pub mod kv;
pub mod relational;
pub mod ttl;

use crate::model::schema::Profile;
use crate::utils::clock::{epoch_seconds, Clock};
use crate::utils::config::{ProfilerConfig, StorageBackend, MAX_TIME_BUCKETS, SECONDS_PER_DAY};
use crate::utils::error::StoreError;
use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;

pub use kv::{KvClient, MemoryKv};
pub use relational::SqliteStore;
pub use ttl::TtlStore;

/// One interval-aligned slice of a time series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeBucket {
    /// Aligned bucket start, epoch seconds
    pub timestamp: i64,
    pub count: u64,
    pub total_duration: f64,
    pub total_query_count: u64,
    pub total_query_time: f64,
    pub avg_duration: f64,
    pub avg_query_count: f64,
    pub avg_query_time: f64,
}

impl TimeBucket {
    pub fn empty(timestamp: i64) -> Self {
        Self {
            timestamp,
            count: 0,
            total_duration: 0.0,
            total_query_count: 0,
            total_query_time: 0.0,
            avg_duration: 0.0,
            avg_query_count: 0.0,
            avg_query_time: 0.0,
        }
    }

    /// Fold one profile's totals in
    pub fn add(&mut self, profile: &Profile) {
        self.count += 1;
        self.total_duration += profile.duration;
        self.total_query_count += profile.query_count;
        self.total_query_time += profile.total_query_time;
        self.refresh_averages();
    }

    /// Recompute the averages from the totals
    pub fn refresh_averages(&mut self) {
        if self.count == 0 {
            self.avg_duration = 0.0;
            self.avg_query_count = 0.0;
            self.avg_query_time = 0.0;
            return;
        }
        let n = self.count as f64;
        self.avg_duration = self.total_duration / n;
        self.avg_query_count = self.total_query_count as f64 / n;
        self.avg_query_time = self.total_query_time / n;
    }

    /// Bucket start as a UTC instant
    pub fn start(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

/// Store-wide averages over every listable profile
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryStats {
    pub total_count: u64,
    pub avg_duration: f64,
    pub avg_query_count: f64,
    pub avg_query_time: f64,
    pub avg_db_time: f64,
    pub avg_view_time: f64,
    pub avg_controller_time: f64,
    pub avg_ruby_time: f64,
    /// Newest first
    pub latest: Vec<Profile>,
}

impl SummaryStats {
    /// Averages over an in-memory profile set
    pub fn from_profiles<'a>(
        profiles: impl IntoIterator<Item = &'a Profile>,
        latest: Vec<Profile>,
    ) -> Self {
        let mut stats = SummaryStats {
            latest,
            ..Default::default()
        };
        for profile in profiles {
            stats.total_count += 1;
            stats.avg_duration += profile.duration;
            stats.avg_query_count += profile.query_count as f64;
            stats.avg_query_time += profile.total_query_time;
            stats.avg_db_time += profile.db_time;
            stats.avg_view_time += profile.view_time;
            stats.avg_controller_time += profile.controller_time;
            stats.avg_ruby_time += profile.ruby_time;
        }
        if stats.total_count > 0 {
            let n = stats.total_count as f64;
            stats.avg_duration /= n;
            stats.avg_query_count /= n;
            stats.avg_query_time /= n;
            stats.avg_db_time /= n;
            stats.avg_view_time /= n;
            stats.avg_controller_time /= n;
            stats.avg_ruby_time /= n;
        }
        stats
    }
}

/// Storage contract shared by both backends
///
/// **Public** - the seam between ingestion, queries and persistence
///
/// Implementations are shared across threads. No method fails: a backend
/// that cannot be reached logs the problem and answers as if it were empty.
pub trait ProfileStore: Send + Sync {
    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Current time as the store sees it
    fn now(&self) -> DateTime<Utc>;

    /// Idempotent upsert keyed by `request_id`
    ///
    /// Profiles with `status < 100` are kept as raw records but never
    /// indexed for listings or aggregates.
    fn put(&self, profile: &Profile);

    fn get(&self, request_id: &str) -> Option<Profile>;

    /// Listable profiles, newest first
    fn list(&self, limit: usize, offset: usize) -> Vec<Profile>;

    /// Listable profiles of one endpoint, newest first
    fn list_by_endpoint(&self, endpoint_name: &str, limit: usize) -> Vec<Profile>;

    /// Number of listable profiles
    fn count(&self) -> u64;

    /// Zero-filled buckets covering `[start, end)`
    fn time_series(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Vec<TimeBucket>;

    /// Hourly buckets over the trailing `days`, ending with the current hour
    fn trends(&self, days: i64) -> Vec<TimeBucket> {
        match trend_window(self.now(), days) {
            Some((start, end)) => self.time_series(start, end, Duration::hours(1)),
            None => Vec::new(),
        }
    }

    fn summary_stats(&self) -> SummaryStats;

    /// Drop everything older than the retention window
    ///
    /// # Returns
    /// Number of records or index entries removed
    fn purge(&self) -> usize;
}

/// Align a timestamp to the start of its bucket
///
/// Hourly buckets align to calendar hours in UTC; every other interval
/// floors `timestamp / interval * interval`.
pub fn align_timestamp(timestamp: i64, interval_seconds: i64) -> i64 {
    if interval_seconds <= 0 {
        return timestamp;
    }
    if interval_seconds == 3600 {
        if let Some(hour) = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .and_then(|at| at.duration_trunc(Duration::hours(1)).ok())
        {
            return hour.timestamp();
        }
    }
    timestamp.div_euclid(interval_seconds) * interval_seconds
}

/// Aligned bucket starts covering `[start, end)`
///
/// Empty when the window or interval is empty. Capped at
/// `MAX_TIME_BUCKETS`.
pub fn bucket_boundaries(start: DateTime<Utc>, end: DateTime<Utc>, interval: Duration) -> Vec<i64> {
    let step = interval.num_seconds();
    if step <= 0 {
        warn!("[profiler] Ignoring time series with non-positive interval {}s", step);
        return Vec::new();
    }
    if end <= start {
        return Vec::new();
    }

    let end_ts = end.timestamp() + i64::from(end.timestamp_subsec_nanos() > 0);
    let mut boundaries = Vec::new();
    let mut current = align_timestamp(start.timestamp(), step);
    while current < end_ts {
        if boundaries.len() == MAX_TIME_BUCKETS {
            warn!(
                "[profiler] Time series truncated to {} buckets ({}s interval)",
                MAX_TIME_BUCKETS, step
            );
            break;
        }
        boundaries.push(current);
        current += step;
    }
    boundaries
}

/// Build a zero-filled series and drop each profile into its bucket
///
/// Only listable profiles with `started_at` in `[start, end)` count.
pub fn fill_buckets<'a>(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: Duration,
    profiles: impl IntoIterator<Item = &'a Profile>,
) -> Vec<TimeBucket> {
    let mut buckets: Vec<TimeBucket> = bucket_boundaries(start, end, interval)
        .into_iter()
        .map(TimeBucket::empty)
        .collect();
    let step = interval.num_seconds();
    let (lower, upper) = (epoch_seconds(start), epoch_seconds(end));

    for profile in profiles {
        if !profile.is_listable() || profile.started_at < lower || profile.started_at >= upper {
            continue;
        }
        let key = align_timestamp(profile.started_at.floor() as i64, step);
        if let Ok(idx) = buckets.binary_search_by_key(&key, |b| b.timestamp) {
            buckets[idx].add(profile);
        }
    }
    buckets
}

/// Window `[align_hour(now) + 1h - days, align_hour(now) + 1h)`
pub fn trend_window(now: DateTime<Utc>, days: i64) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    if days <= 0 {
        return None;
    }
    let hour = now.duration_trunc(Duration::hours(1)).ok()?;
    let end = hour.checked_add_signed(Duration::hours(1))?;
    let span = Duration::try_seconds(days.checked_mul(SECONDS_PER_DAY)?)?;
    let start = end.checked_sub_signed(span)?;
    Some((start, end))
}

/// Epoch-seconds cutoff below which records are past `retention`
///
/// `None` when `now - retention` falls outside the calendar range, in
/// which case nothing is old enough to purge.
pub(crate) fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> Option<f64> {
    now.checked_sub_signed(retention).map(epoch_seconds)
}

/// Unwrap a backend result, logging and substituting the empty value
pub(crate) fn degrade<T: Default>(backend: &str, operation: &str, result: Result<T, StoreError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!("[profiler] {} store {} failed: {}", backend, operation, e);
            T::default()
        }
    }
}

/// Build the store selected by the configuration
///
/// **Public** - strategy selection, done once at configure time
///
/// A relational store whose database cannot be opened is replaced by a
/// degraded one that answers every read with nothing.
pub fn open_store(config: &ProfilerConfig, clock: Arc<dyn Clock>) -> Arc<dyn ProfileStore> {
    let retention = config.retention();
    match config.storage_backend {
        StorageBackend::TtlStore => {
            info!("[profiler] Using TTL store (retention {} days)", config.retention_days);
            let kv = MemoryKv::new(clock.clone());
            Arc::new(TtlStore::new(Arc::new(kv), retention, clock))
        }
        StorageBackend::Relational => {
            info!(
                "[profiler] Using relational store at {}",
                config.database_path.display()
            );
            match SqliteStore::open(&config.database_path, retention, clock.clone()) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!(
                        "[profiler] Cannot open {}: {}, profiles will not be stored",
                        config.database_path.display(),
                        e
                    );
                    Arc::new(SqliteStore::unavailable(e.to_string(), retention, clock))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_align_hourly_and_floor() {
        let ts = at(13, 47, 12).timestamp();
        assert_eq!(align_timestamp(ts, 3600), at(13, 0, 0).timestamp());
        assert_eq!(align_timestamp(ts, 300), at(13, 45, 0).timestamp());
        assert_eq!(align_timestamp(ts, 86_400), at(0, 0, 0).timestamp());
    }

    #[test]
    fn test_one_hour_at_five_minutes_is_twelve_buckets() {
        let buckets = fill_buckets(
            at(10, 0, 0),
            at(11, 0, 0),
            Duration::minutes(5),
            std::iter::empty(),
        );
        assert_eq!(buckets.len(), 12);
        assert!(buckets.iter().all(|b| b.count == 0));
        assert_eq!(buckets[0].timestamp, at(10, 0, 0).timestamp());
        assert_eq!(buckets[11].timestamp, at(10, 55, 0).timestamp());
    }

    #[test]
    fn test_unaligned_start_rounds_down() {
        let boundaries = bucket_boundaries(at(10, 2, 0), at(10, 10, 0), Duration::minutes(5));
        assert_eq!(
            boundaries,
            vec![at(10, 0, 0).timestamp(), at(10, 5, 0).timestamp()]
        );
    }

    #[test]
    fn test_degenerate_windows() {
        assert!(bucket_boundaries(at(11, 0, 0), at(10, 0, 0), Duration::minutes(5)).is_empty());
        assert!(bucket_boundaries(at(10, 0, 0), at(11, 0, 0), Duration::zero()).is_empty());
        let huge = bucket_boundaries(at(0, 0, 0), at(23, 0, 0), Duration::seconds(1));
        assert_eq!(huge.len(), MAX_TIME_BUCKETS);
    }

    #[test]
    fn test_trend_window_ends_after_current_hour() {
        let (start, end) = trend_window(at(13, 20, 0), 1).unwrap();
        assert_eq!(end, at(14, 0, 0));
        assert_eq!(end - start, Duration::days(1));
        assert!(trend_window(at(13, 20, 0), 0).is_none());
    }

    #[test]
    fn test_trend_window_beyond_calendar_is_none() {
        assert!(trend_window(at(13, 20, 0), 200_000_000).is_none());
        assert!(trend_window(at(13, 20, 0), i64::MAX).is_none());
        assert!(trend_window(DateTime::<Utc>::MAX_UTC, 1).is_none());
    }

    #[test]
    fn test_retention_cutoff_saturates() {
        let now = at(12, 0, 0);
        assert_eq!(
            retention_cutoff(now, Duration::days(1)),
            Some(epoch_seconds(now) - 86_400.0)
        );
        assert_eq!(retention_cutoff(now, Duration::MAX), None);
    }

    #[test]
    fn test_summary_of_nothing_is_zero() {
        let stats = SummaryStats::from_profiles(std::iter::empty(), Vec::new());
        assert_eq!(stats, SummaryStats::default());
    }
}
