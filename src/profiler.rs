//! The profiler facade.
//!
//! `Profiler` is what a host embeds: it is configured once, decides per
//! unit of work whether to open a session, writes the finished profile to
//! the configured store exactly once, and answers the dashboard's queries.
//! Nothing on these paths returns a storage failure to the host.

use crate::collector::sampler::Sampler;
use crate::collector::session::{Session, SessionOptions};
use crate::model::schema::{Profile, RequestMetadata};
use crate::query::QueryEngine;
use crate::storage::{open_store, ProfileStore};
use crate::utils::clock::{system_clock, Clock};
use crate::utils::config::ProfilerConfig;
use crate::utils::error::{CollectorError, ConfigError};
use log::{debug, info};
use std::ops::Deref;
use std::sync::Arc;

/// Shared, thread-safe profiler instance
#[derive(Clone)]
pub struct Profiler {
    config: Arc<ProfilerConfig>,
    sampler: Sampler,
    store: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
    queries: QueryEngine,
}

impl Profiler {
    /// Validate the configuration and open the selected store
    ///
    /// **Public** - the only place configuration errors surface
    ///
    /// # Errors
    /// Any `ConfigError` from validation
    pub fn configure(config: ProfilerConfig) -> Result<Self, ConfigError> {
        Self::configure_with_clock(config, system_clock())
    }

    /// Same as `configure`, with an explicit time source
    pub fn configure_with_clock(
        config: ProfilerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = open_store(&config, clock.clone());
        Ok(Self::assemble(config, store, clock))
    }

    /// Use a caller-built store instead of the configured backend
    pub fn with_store(
        config: ProfilerConfig,
        store: Arc<dyn ProfileStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::assemble(config, store, clock))
    }

    fn assemble(config: ProfilerConfig, store: Arc<dyn ProfileStore>, clock: Arc<dyn Clock>) -> Self {
        info!(
            "[profiler] Configured: enabled={}, sample_rate={}, backend={}",
            config.enabled,
            config.sample_rate,
            store.backend_name()
        );
        Self {
            sampler: Sampler::from_config(&config),
            queries: QueryEngine::new(store.clone()),
            config: Arc::new(config),
            store,
            clock,
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ProfileStore> {
        &self.store
    }

    /// Open a session if this unit of work is sampled
    ///
    /// **Public** - ingestion entry point
    ///
    /// # Returns
    /// `Ok(None)` when the unit of work was not selected
    ///
    /// # Errors
    /// `DuplicateSession` if `id` is already active on this thread
    pub fn begin_session(
        &self,
        id: impl Into<String>,
        metadata: RequestMetadata,
    ) -> Result<Option<Session>, CollectorError> {
        if !self.sampler.should_profile(&metadata.path) {
            return Ok(None);
        }
        self.start_session(id, metadata).map(Some)
    }

    /// Open a session unconditionally, bypassing sampling
    pub fn start_session(
        &self,
        id: impl Into<String>,
        metadata: RequestMetadata,
    ) -> Result<Session, CollectorError> {
        Session::start(
            id,
            metadata,
            SessionOptions::from(self.config.as_ref()),
            self.clock.clone(),
        )
    }

    /// Finish a session and persist its profile
    ///
    /// Only the call that actually finishes the session writes to the
    /// store; later calls return the cached profile untouched.
    pub fn end_session(
        &self,
        session: &mut Session,
        status: u16,
        total_duration: Option<f64>,
    ) -> Profile {
        if session.is_finished() {
            debug!("[profiler] Session {} already finished", session.id());
            return session.finish(status, total_duration);
        }
        let profile = session.finish(status, total_duration);
        self.store.put(&profile);
        profile
    }

    /// Delete profiles older than the retention window
    pub fn purge(&self) -> usize {
        self.store.purge()
    }
}

/// The query API is the query engine's
impl Deref for Profiler {
    type Target = QueryEngine;

    fn deref(&self) -> &QueryEngine {
        &self.queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryKv, SummaryStats, TimeBucket, TtlStore};
    use crate::utils::clock::ManualClock;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store wrapper counting writes
    struct CountingStore {
        inner: TtlStore,
        puts: AtomicUsize,
    }

    impl ProfileStore for CountingStore {
        fn backend_name(&self) -> &'static str {
            "counting"
        }
        fn now(&self) -> DateTime<Utc> {
            self.inner.now()
        }
        fn put(&self, profile: &Profile) {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(profile)
        }
        fn get(&self, request_id: &str) -> Option<Profile> {
            self.inner.get(request_id)
        }
        fn list(&self, limit: usize, offset: usize) -> Vec<Profile> {
            self.inner.list(limit, offset)
        }
        fn list_by_endpoint(&self, endpoint_name: &str, limit: usize) -> Vec<Profile> {
            self.inner.list_by_endpoint(endpoint_name, limit)
        }
        fn count(&self) -> u64 {
            self.inner.count()
        }
        fn time_series(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            interval: Duration,
        ) -> Vec<TimeBucket> {
            self.inner.time_series(start, end, interval)
        }
        fn summary_stats(&self) -> SummaryStats {
            self.inner.summary_stats()
        }
        fn purge(&self) -> usize {
            self.inner.purge()
        }
    }

    fn profiler(sample_rate: f64) -> (Profiler, Arc<CountingStore>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 4, 8, 0, 0).unwrap(),
        ));
        let store = Arc::new(CountingStore {
            inner: TtlStore::new(
                Arc::new(MemoryKv::new(clock.clone())),
                Duration::days(7),
                clock.clone(),
            ),
            puts: AtomicUsize::new(0),
        });
        let config = ProfilerConfig {
            sample_rate,
            ..ProfilerConfig::default()
        };
        let profiler = Profiler::with_store(config, store.clone(), clock).unwrap();
        (profiler, store)
    }

    #[test]
    fn test_end_session_writes_once() {
        let (profiler, store) = profiler(1.0);
        let mut session = profiler
            .begin_session("once", RequestMetadata::new("GET", "/users"))
            .unwrap()
            .unwrap();

        let first = profiler.end_session(&mut session, 200, Some(10.0));
        let second = profiler.end_session(&mut session, 200, Some(10.0));

        assert_eq!(first, second);
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert_eq!(profiler.get_profile("once"), Some(first));
    }

    #[test]
    fn test_unsampled_returns_none() {
        let (profiler, _store) = profiler(0.0);
        let session = profiler
            .begin_session("skip", RequestMetadata::new("GET", "/users"))
            .unwrap();
        assert!(session.is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_, store) = profiler(1.0);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let config = ProfilerConfig {
            retention_days: 0,
            ..ProfilerConfig::default()
        };
        assert!(matches!(
            Profiler::with_store(config, store, clock),
            Err(ConfigError::InvalidRetention(0))
        ));
    }
}
