//! Read-side queries for the dashboard.
//!
//! Everything here is built on the `ProfileStore` read contract only, so it
//! behaves identically over either backend. Store degradation shows through
//! as empty results, never as errors.

use crate::aggregator::hotspots::HotspotAccumulator;
use crate::model::schema::{Hotspots, Profile};
use crate::storage::{ProfileStore, SummaryStats, TimeBucket};
use crate::utils::config::{ENDPOINT_WINDOW, RECENT_QUERY_WINDOW};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A query lifted out of its profile, with the owner's context attached
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQuery {
    pub sql: String,
    pub name: Option<String>,
    pub duration: f64,
    pub request_id: String,
    pub path: String,
    pub endpoint_name: String,
    /// Owning profile's start, epoch seconds
    pub started_at: f64,
}

/// Per-endpoint aggregate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStat {
    pub endpoint_name: String,
    pub request_count: u64,
    pub avg_duration: f64,
    pub max_duration: f64,
    pub avg_db_time: f64,
    pub avg_view_time: f64,
    pub avg_controller_time: f64,
    pub avg_ruby_time: f64,
    pub avg_query_count: f64,
    pub db_percentage: f64,
    pub view_percentage: f64,
    pub controller_percentage: f64,
    pub ruby_percentage: f64,
}

impl EndpointStat {
    fn from_group(endpoint_name: String, profiles: &[&Profile]) -> Self {
        let n = profiles.len().max(1) as f64;
        let avg = |f: fn(&Profile) -> f64| profiles.iter().map(|p| f(p)).sum::<f64>() / n;

        let mut stat = EndpointStat {
            endpoint_name,
            request_count: profiles.len() as u64,
            avg_duration: avg(|p| p.duration),
            max_duration: profiles.iter().map(|p| p.duration).fold(0.0, f64::max),
            avg_db_time: avg(|p| p.db_time),
            avg_view_time: avg(|p| p.view_time),
            avg_controller_time: avg(|p| p.controller_time),
            avg_ruby_time: avg(|p| p.ruby_time),
            avg_query_count: avg(|p| p.query_count as f64),
            db_percentage: 0.0,
            view_percentage: 0.0,
            controller_percentage: 0.0,
            ruby_percentage: 0.0,
        };
        stat.derive_percentages();
        stat
    }

    /// Category shares of the average duration, never summing above 100
    fn derive_percentages(&mut self) {
        if self.avg_duration <= 0.0 {
            return;
        }
        let share = |time: f64| (time / self.avg_duration) * 100.0;
        let mut shares = [
            share(self.avg_db_time),
            share(self.avg_view_time),
            share(self.avg_controller_time),
            share(self.avg_ruby_time),
        ];
        let total: f64 = shares.iter().sum();
        if total > 100.0 {
            for value in shares.iter_mut() {
                *value *= 100.0 / total;
            }
        }
        [
            self.db_percentage,
            self.view_percentage,
            self.controller_percentage,
            self.ruby_percentage,
        ] = shares;
    }
}

/// Statement class by leading SQL keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl QueryType {
    /// Classify a statement, case-insensitively
    pub fn classify(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("");
        match keyword.to_ascii_uppercase().as_str() {
            "SELECT" => QueryType::Select,
            "INSERT" => QueryType::Insert,
            "UPDATE" => QueryType::Update,
            "DELETE" => QueryType::Delete,
            _ => QueryType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Select => "SELECT",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::Other => "OTHER",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One page of the profile listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfilePage {
    pub profiles: Vec<Profile>,
    /// 1-based
    pub page: usize,
    pub page_size: usize,
    pub total_count: u64,
    pub total_pages: u64,
}

/// Aggregate queries over a profile store
///
/// **Public** - backs the query API and the CLI
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn ProfileStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ProfileStore> {
        &self.store
    }

    pub fn get_profile(&self, request_id: &str) -> Option<Profile> {
        self.store.get(request_id)
    }

    /// Paginated listing, newest first
    ///
    /// # Arguments
    /// * `page` - 1-based page number; 0 is treated as 1
    /// * `page_size` - Profiles per page; 0 is treated as 1
    pub fn list_profiles(&self, page: usize, page_size: usize) -> ProfilePage {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let profiles = self
            .store
            .list(page_size, (page - 1).saturating_mul(page_size));
        let total_count = self.store.count();

        ProfilePage {
            profiles,
            page,
            page_size,
            total_count,
            total_pages: total_count.div_ceil(page_size as u64),
        }
    }

    pub fn list_by_endpoint(&self, endpoint_name: &str, limit: usize) -> Vec<Profile> {
        self.store.list_by_endpoint(endpoint_name, limit)
    }

    pub fn time_series(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Vec<TimeBucket> {
        self.store.time_series(start, end, interval)
    }

    pub fn trends(&self, days: i64) -> Vec<TimeBucket> {
        self.store.trends(days)
    }

    pub fn summary_stats(&self) -> SummaryStats {
        self.store.summary_stats()
    }

    /// Slowest queries across the recent profile window
    ///
    /// # Returns
    /// Up to `limit` queries, slowest first; equal durations keep their
    /// newest-profile-first order
    pub fn slowest_queries(&self, limit: usize) -> Vec<SlowQuery> {
        let profiles = self.store.list(RECENT_QUERY_WINDOW, 0);
        let mut queries: Vec<SlowQuery> = profiles
            .iter()
            .flat_map(|profile| {
                profile.queries.iter().map(move |query| SlowQuery {
                    sql: query.sql.clone(),
                    name: query.name.clone(),
                    duration: query.duration,
                    request_id: profile.request_id.clone(),
                    path: profile.path.clone(),
                    endpoint_name: profile.endpoint_name.clone(),
                    started_at: profile.started_at,
                })
            })
            .collect();

        queries.sort_by(|a, b| b.duration.total_cmp(&a.duration));
        queries.truncate(limit);
        queries
    }

    /// Group recent profiles by endpoint, slowest average first
    pub fn aggregate_endpoints(&self) -> Vec<EndpointStat> {
        let profiles = self.store.list(ENDPOINT_WINDOW, 0);

        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<&Profile>> = HashMap::new();
        for profile in &profiles {
            let name = profile.endpoint_name.as_str();
            groups
                .entry(name)
                .or_insert_with(|| {
                    order.push(name);
                    Vec::new()
                })
                .push(profile);
        }

        let mut stats: Vec<EndpointStat> = order
            .into_iter()
            .filter_map(|name| {
                let group = groups.get(name)?;
                Some(EndpointStat::from_group(name.to_string(), group))
            })
            .collect();
        stats.sort_by(|a, b| b.avg_duration.total_cmp(&a.avg_duration));

        debug!("[profiler] Aggregated {} endpoints", stats.len());
        stats
    }

    /// Count queries by statement class over the `window` newest profiles
    ///
    /// Classes with no queries are left out.
    pub fn query_type_distribution(&self, window: usize) -> BTreeMap<QueryType, u64> {
        let mut distribution = BTreeMap::new();
        for profile in self.store.list(window, 0) {
            for query in &profile.queries {
                *distribution.entry(QueryType::classify(&query.sql)).or_insert(0) += 1;
            }
        }
        distribution
    }

    /// Hotspots rolled up across the `window` newest profiles
    pub fn hotspots(&self, window: usize) -> Hotspots {
        let mut accumulator = HotspotAccumulator::new();
        for profile in self.store.list(window, 0) {
            accumulator.absorb_all(&profile.additional_data.hotspots);
        }
        accumulator.into_hotspots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::storage::{MemoryKv, TtlStore};
    use crate::utils::clock::{epoch_seconds, Clock, ManualClock};
    use chrono::TimeZone;

    fn engine() -> (QueryEngine, Arc<dyn ProfileStore>, f64) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let now = epoch_seconds(clock.now());
        let store: Arc<dyn ProfileStore> = Arc::new(TtlStore::new(
            Arc::new(MemoryKv::new(clock.clone())),
            Duration::days(7),
            clock,
        ));
        (QueryEngine::new(store.clone()), store, now)
    }

    #[test]
    fn test_classify() {
        assert_eq!(QueryType::classify("  select * from users"), QueryType::Select);
        assert_eq!(QueryType::classify("INSERT INTO t VALUES (1)"), QueryType::Insert);
        assert_eq!(QueryType::classify("Update t SET a = 1"), QueryType::Update);
        assert_eq!(QueryType::classify("WITH x AS (SELECT 1) SELECT * FROM x"), QueryType::Other);
        assert_eq!(QueryType::classify(""), QueryType::Other);
    }

    #[test]
    fn test_distribution_omits_empty_classes() {
        let (engine, store, now) = engine();
        store.put(&fixtures::profile_with_queries(
            "r1",
            "users",
            now,
            50.0,
            &[
                ("SELECT * FROM users", 1.0),
                ("SELECT * FROM posts", 2.0),
                ("INSERT INTO logs VALUES (1)", 1.0),
                ("DELETE FROM sessions", 1.0),
            ],
        ));

        let distribution = engine.query_type_distribution(100);
        let expected: BTreeMap<QueryType, u64> = [
            (QueryType::Select, 2),
            (QueryType::Insert, 1),
            (QueryType::Delete, 1),
        ]
        .into_iter()
        .collect();
        assert_eq!(distribution, expected);
    }

    #[test]
    fn test_slowest_queries_carry_owner() {
        let (engine, store, now) = engine();
        store.put(&fixtures::profile_with_queries(
            "a",
            "users",
            now - 10.0,
            50.0,
            &[("SELECT 1", 3.0), ("SELECT 2", 30.0)],
        ));
        store.put(&fixtures::profile_with_queries(
            "b",
            "posts",
            now,
            50.0,
            &[("SELECT 3", 12.0)],
        ));

        let slow = engine.slowest_queries(2);
        assert_eq!(slow.len(), 2);
        assert_eq!(slow[0].sql, "SELECT 2");
        assert_eq!(slow[0].request_id, "a");
        assert_eq!(slow[1].endpoint_name, "posts");
    }

    #[test]
    fn test_endpoint_aggregation() {
        let (engine, store, now) = engine();
        store.put(&fixtures::profile_with_queries("a", "fast", now, 10.0, &[("SELECT 1", 5.0)]));
        store.put(&fixtures::profile_with_queries("b", "slow", now + 1.0, 100.0, &[]));
        store.put(&fixtures::profile_with_queries("c", "slow", now + 2.0, 50.0, &[]));

        let stats = engine.aggregate_endpoints();
        assert_eq!(stats[0].endpoint_name, "slow");
        assert_eq!(stats[0].request_count, 2);
        assert_eq!(stats[0].avg_duration, 75.0);
        assert_eq!(stats[0].max_duration, 100.0);
        assert_eq!(stats[1].db_percentage, 50.0);
        assert_eq!(stats[1].ruby_percentage, 50.0);
    }

    #[test]
    fn test_percentages_capped() {
        let mut stat = EndpointStat::from_group("x".to_string(), &[]);
        stat.avg_duration = 10.0;
        stat.avg_db_time = 10.0;
        stat.avg_view_time = 10.0;
        stat.derive_percentages();
        assert_eq!(stat.db_percentage + stat.view_percentage, 100.0);
    }

    #[test]
    fn test_pagination() {
        let (engine, store, now) = engine();
        for i in 0..5 {
            store.put(&fixtures::profile(&format!("r{}", i), now + i as f64, 1.0, 200));
        }

        let page = engine.list_profiles(2, 2);
        let ids: Vec<&str> = page.profiles.iter().map(|p| p.request_id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
        assert_eq!(page.total_count, 5);
        assert_eq!(page.total_pages, 3);
    }

    #[test]
    fn test_cross_profile_hotspots() {
        let (engine, store, now) = engine();
        store.put(&fixtures::profile("a", now, 40.0, 200));
        store.put(&fixtures::profile("b", now + 1.0, 60.0, 200));

        let hotspots = engine.hotspots(100);
        assert_eq!(hotspots.controllers.len(), 1);
        assert_eq!(hotspots.controllers[0].value, 100.0);
        assert_eq!(hotspots.controllers[0].data.count, 2);
    }
}
