//! TTL key-value profile store.
//!
//! Layout:
//! - `request_profiler:profile:<request_id>` holds the profile JSON and
//!   expires after the retention window
//! - `request_profiler:profiles` is a sorted set of request ids scored by
//!   `started_at`, used for ordering and time-range reads
//!
//! Index entries whose record has expired are pruned as reads find them.
//! `purge` also sweeps expired values that no index entry points at, such
//! as records for non-HTTP statuses.

use super::kv::KvClient;
use super::{degrade, fill_buckets, retention_cutoff, ProfileStore, SummaryStats, TimeBucket};
use crate::model::schema::Profile;
use crate::utils::clock::{epoch_seconds, Clock};
use crate::utils::config::{INDEX_SCAN_CHUNK, SUMMARY_LATEST_LIMIT};
use crate::utils::error::StoreError;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

const PROFILE_KEY_PREFIX: &str = "request_profiler:profile:";
const INDEX_KEY: &str = "request_profiler:profiles";

/// Profile store over a `KvClient`
pub struct TtlStore {
    kv: Arc<dyn KvClient>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl TtlStore {
    pub fn new(kv: Arc<dyn KvClient>, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            retention,
            clock,
        }
    }

    fn profile_key(request_id: &str) -> String {
        format!("{}{}", PROFILE_KEY_PREFIX, request_id)
    }

    fn try_put(&self, profile: &Profile) -> Result<(), StoreError> {
        let json = serde_json::to_string(profile)?;
        self.kv
            .set_ex(&Self::profile_key(&profile.request_id), &json, self.retention)?;

        if profile.is_listable() {
            self.kv
                .zadd(INDEX_KEY, profile.started_at, &profile.request_id)?;
        } else {
            debug!(
                "[profiler] Profile {} has status {}, stored but not indexed",
                profile.request_id, profile.status
            );
        }
        Ok(())
    }

    fn load(&self, request_id: &str) -> Result<Option<Profile>, StoreError> {
        let Some(json) = self.kv.get(&Self::profile_key(request_id))? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| StoreError::MalformedRecord {
                request_id: request_id.to_string(),
                source,
            })
    }

    /// Load an indexed id for a listing
    ///
    /// Malformed records are skipped; ids whose record is gone are pushed
    /// onto `stale` for pruning once the scan is over.
    fn load_indexed(
        &self,
        request_id: &str,
        stale: &mut Vec<String>,
    ) -> Result<Option<Profile>, StoreError> {
        match self.load(request_id) {
            Ok(Some(profile)) if profile.is_listable() => Ok(Some(profile)),
            Ok(Some(_)) => Ok(None),
            Ok(None) => {
                stale.push(request_id.to_string());
                Ok(None)
            }
            Err(e @ StoreError::MalformedRecord { .. }) => {
                warn!("[profiler] Skipping record: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn prune(&self, stale: &[String]) -> Result<(), StoreError> {
        for request_id in stale {
            debug!("[profiler] Pruning expired index entry {}", request_id);
            self.kv.zrem(INDEX_KEY, request_id)?;
        }
        Ok(())
    }

    /// Visit listable profiles newest first until `visit` returns false
    fn scan_newest(&self, mut visit: impl FnMut(Profile) -> bool) -> Result<(), StoreError> {
        let mut stale = Vec::new();
        let mut rank = 0;
        'scan: loop {
            let ids = self
                .kv
                .zrevrange(INDEX_KEY, rank, rank + INDEX_SCAN_CHUNK - 1)?;
            if ids.is_empty() {
                break;
            }
            rank += ids.len();
            for request_id in &ids {
                if let Some(profile) = self.load_indexed(request_id, &mut stale)? {
                    if !visit(profile) {
                        break 'scan;
                    }
                }
            }
        }
        self.prune(&stale)
    }

    fn try_list(
        &self,
        limit: usize,
        offset: usize,
        endpoint: Option<&str>,
    ) -> Result<Vec<Profile>, StoreError> {
        let mut profiles = Vec::new();
        if limit == 0 {
            return Ok(profiles);
        }
        let mut skipped = 0;
        self.scan_newest(|profile| {
            if endpoint.is_some_and(|name| profile.endpoint_name != name) {
                return true;
            }
            if skipped < offset {
                skipped += 1;
                return true;
            }
            profiles.push(profile);
            profiles.len() < limit
        })?;
        Ok(profiles)
    }

    fn try_time_series(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Result<Vec<TimeBucket>, StoreError> {
        let entries = self
            .kv
            .zrangebyscore(INDEX_KEY, epoch_seconds(start), epoch_seconds(end))?;

        let mut stale = Vec::new();
        let mut profiles = Vec::with_capacity(entries.len());
        for (request_id, _) in &entries {
            if let Some(profile) = self.load_indexed(request_id, &mut stale)? {
                profiles.push(profile);
            }
        }
        self.prune(&stale)?;

        Ok(fill_buckets(start, end, interval, &profiles))
    }

    fn try_summary(&self) -> Result<SummaryStats, StoreError> {
        let mut profiles = Vec::new();
        self.scan_newest(|profile| {
            profiles.push(profile);
            true
        })?;
        let latest = profiles.iter().take(SUMMARY_LATEST_LIMIT).cloned().collect();
        Ok(SummaryStats::from_profiles(&profiles, latest))
    }

    fn try_purge(&self) -> Result<usize, StoreError> {
        let cutoff =
            retention_cutoff(self.clock.now(), self.retention).unwrap_or(f64::NEG_INFINITY);
        let entries = self
            .kv
            .zrangebyscore(INDEX_KEY, f64::NEG_INFINITY, f64::INFINITY)?;

        let mut removed = 0;
        for (request_id, started_at) in entries {
            let key = Self::profile_key(&request_id);
            if started_at < cutoff {
                self.kv.del(&key)?;
            } else if self.kv.get(&key)?.is_some() {
                continue;
            }
            self.kv.zrem(INDEX_KEY, &request_id)?;
            removed += 1;
        }
        Ok(removed + self.kv.evict_expired()?)
    }

    /// Count listable profiles by walking the index
    ///
    /// The index alone can still hold ids whose record has expired; the
    /// walk prunes them so `count` agrees with `list`.
    fn try_count(&self) -> Result<u64, StoreError> {
        let mut total = 0;
        self.scan_newest(|_| {
            total += 1;
            true
        })?;
        Ok(total)
    }
}

impl ProfileStore for TtlStore {
    fn backend_name(&self) -> &'static str {
        "ttl"
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn put(&self, profile: &Profile) {
        if let Err(e) = self.try_put(profile) {
            warn!(
                "[profiler] Dropping profile {} (ttl store): {}",
                profile.request_id, e
            );
        }
    }

    fn get(&self, request_id: &str) -> Option<Profile> {
        match self.load(request_id) {
            Ok(profile) => profile,
            Err(e) => {
                warn!("[profiler] ttl store get {} failed: {}", request_id, e);
                None
            }
        }
    }

    fn list(&self, limit: usize, offset: usize) -> Vec<Profile> {
        degrade("ttl", "list", self.try_list(limit, offset, None))
    }

    fn list_by_endpoint(&self, endpoint_name: &str, limit: usize) -> Vec<Profile> {
        degrade(
            "ttl",
            "list_by_endpoint",
            self.try_list(limit, 0, Some(endpoint_name)),
        )
    }

    fn count(&self) -> u64 {
        degrade("ttl", "count", self.try_count())
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
                warn!("[profiler] ttl store time_series failed: {}", e);
                // Shape is still known, so answer with zeroed buckets
                fill_buckets(start, end, interval, std::iter::empty())
            }
        }
    }

    fn summary_stats(&self) -> SummaryStats {
        degrade("ttl", "summary_stats", self.try_summary())
    }

    fn purge(&self) -> usize {
        let removed = degrade("ttl", "purge", self.try_purge());
        info!("[profiler] ttl store purge removed {} entries", removed);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::storage::kv::MemoryKv;
    use crate::utils::clock::ManualClock;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    struct Harness {
        store: TtlStore,
        kv: Arc<MemoryKv>,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let kv = Arc::new(MemoryKv::new(Arc::new(clock.clone())));
        let store = TtlStore::new(kv.clone(), Duration::days(7), Arc::new(clock.clone()));
        Harness { store, kv, clock }
    }

    fn now_secs(clock: &ManualClock) -> f64 {
        epoch_seconds(clock.now())
    }

    #[test]
    fn test_round_trip_and_ordering() {
        let h = harness();
        let t = now_secs(&h.clock);
        let older = fixtures::profile("older", t - 60.0, 10.0, 200);
        let newer = fixtures::profile("newer", t - 5.0, 20.0, 200);
        h.store.put(&older);
        h.store.put(&newer);
        h.store.put(&newer);

        assert_eq!(h.store.get("older"), Some(older.clone()));
        let ids: Vec<String> = h.store.list(10, 0).into_iter().map(|p| p.request_id).collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert_eq!(h.store.count(), 2);
        assert_eq!(h.store.list(10, 1)[0].request_id, "older");
    }

    #[test]
    fn test_non_http_status_not_indexed() {
        let h = harness();
        let transport = fixtures::profile("ws", now_secs(&h.clock), 3.0, 0);
        h.store.put(&transport);

        assert!(h.store.get("ws").is_some());
        assert!(h.store.list(10, 0).is_empty());
        assert_eq!(h.store.summary_stats().total_count, 0);
    }

    #[test]
    fn test_records_expire_after_retention() {
        let h = harness();
        h.store
            .put(&fixtures::profile("r1", now_secs(&h.clock), 5.0, 200));

        h.clock.advance(Duration::days(7) + Duration::seconds(1));
        assert!(h.store.get("r1").is_none());
        assert!(h.store.list(10, 0).is_empty());
        assert_eq!(h.store.count(), 0);
    }

    #[test]
    fn test_count_skips_expired_records_without_a_listing() {
        let h = harness();
        h.store
            .put(&fixtures::profile("old", now_secs(&h.clock), 5.0, 200));
        h.clock.advance(Duration::days(6));
        h.store
            .put(&fixtures::profile("new", now_secs(&h.clock), 5.0, 200));
        h.clock.advance(Duration::hours(36));

        assert_eq!(h.kv.zcard(INDEX_KEY).unwrap(), 2);
        assert_eq!(h.store.count(), 1);
        assert_eq!(h.kv.zcard(INDEX_KEY).unwrap(), 1);
    }

    #[test]
    fn test_purge_sweeps_unindexed_records() {
        let h = harness();
        let t = now_secs(&h.clock);
        for n in 0..3 {
            h.store
                .put(&fixtures::profile(&format!("ws{}", n), t, 1.0, 0));
        }
        assert_eq!(h.kv.len(), 3);

        h.clock.advance(Duration::days(7) + Duration::seconds(1));
        assert_eq!(h.store.purge(), 3);
        assert!(h.kv.is_empty());
    }

    #[test]
    fn test_huge_retention_neither_panics_nor_purges() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let kv = Arc::new(MemoryKv::new(Arc::new(clock.clone())));
        let store = TtlStore::new(kv.clone(), Duration::MAX, Arc::new(clock.clone()));
        let t = now_secs(&clock);
        store.put(&fixtures::profile("kept", t - 400.0 * 86_400.0, 5.0, 200));

        assert_eq!(store.count(), 1);
        assert_eq!(store.purge(), 0);
        assert!(store.get("kept").is_some());
    }

    #[test]
    fn test_purge_drops_old_index_entries() {
        let h = harness();
        let t = now_secs(&h.clock);
        h.store
            .put(&fixtures::profile("ancient", t - 8.0 * 86_400.0, 5.0, 200));
        h.store.put(&fixtures::profile("fresh", t, 5.0, 200));

        assert_eq!(h.store.purge(), 1);
        assert_eq!(h.store.count(), 1);
        assert!(h.store.get("ancient").is_none());
    }

    #[test]
    fn test_unavailable_backend_degrades() {
        let h = harness();
        h.store
            .put(&fixtures::profile("r1", now_secs(&h.clock), 5.0, 200));
        h.kv.set_available(false);

        h.store
            .put(&fixtures::profile("r2", now_secs(&h.clock), 5.0, 200));
        assert!(h.store.get("r1").is_none());
        assert!(h.store.list(10, 0).is_empty());
        assert_eq!(h.store.summary_stats(), SummaryStats::default());

        let end = h.clock.now();
        let series = h.store.time_series(end - Duration::hours(1), end, Duration::minutes(5));
        assert_eq!(series.len(), 12);

        h.kv.set_available(true);
        assert_eq!(h.store.count(), 1);
    }

    #[test]
    fn test_malformed_record_skipped() {
        let h = harness();
        let t = now_secs(&h.clock);
        h.store.put(&fixtures::profile("good", t, 5.0, 200));
        h.kv
            .set_ex("request_profiler:profile:bad", "{not json", Duration::days(1))
            .unwrap();
        h.kv.zadd(INDEX_KEY, t + 1.0, "bad").unwrap();

        let listed = h.store.list(10, 0);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].request_id, "good");
    }
}
