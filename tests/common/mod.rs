#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use request_profiler::model::{MethodDescriptor, RequestMetadata};
use request_profiler::storage::{MemoryKv, ProfileStore, SqliteStore, TtlStore};
use request_profiler::utils::clock::{Clock, ManualClock};
use request_profiler::{Profile, Profiler, ProfilerConfig};
use std::sync::Arc;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

pub fn manual_clock() -> ManualClock {
    ManualClock::new(start_time())
}

/// Profile everything, keep a week
pub fn config() -> ProfilerConfig {
    ProfilerConfig {
        sample_rate: 1.0,
        ..ProfilerConfig::default()
    }
}

pub fn ttl_store(clock: &ManualClock) -> Arc<dyn ProfileStore> {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let kv = MemoryKv::new(clock.clone());
    Arc::new(TtlStore::new(Arc::new(kv), Duration::days(7), clock))
}

pub fn sqlite_store(clock: &ManualClock) -> Arc<dyn ProfileStore> {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    Arc::new(SqliteStore::open_in_memory(Duration::days(7), clock).unwrap())
}

/// One store of each backend, each with its own clock
pub fn backends() -> Vec<(Arc<dyn ProfileStore>, ManualClock)> {
    let ttl_clock = manual_clock();
    let sql_clock = manual_clock();
    vec![
        (ttl_store(&ttl_clock), ttl_clock),
        (sqlite_store(&sql_clock), sql_clock),
    ]
}

pub fn profiler(store: Arc<dyn ProfileStore>, clock: &ManualClock) -> Profiler {
    Profiler::with_store(config(), store, Arc::new(clock.clone())).unwrap()
}

pub fn users_index() -> RequestMetadata {
    RequestMetadata::new("GET", "/users").with_controller("UsersController", "index")
}

/// Record a request through the ingestion API
///
/// 50ms of queries, 20ms of rendering and 10ms inside the controller
/// action, finished with a 120ms total.
pub fn record_users_request(profiler: &Profiler, clock: &ManualClock, id: &str) -> Profile {
    let mut session = profiler.start_session(id, users_index()).unwrap();
    {
        let _action = session.enter(MethodDescriptor::new("UsersController#index"));
        clock.advance(Duration::milliseconds(10));
    }
    session.record_query("SELECT * FROM users", Some("User Load"), 30.0, 0.0);
    session.record_query("SELECT * FROM posts", Some("Post Load"), 20.0, 0.0);
    session.record_render("users/index.html.erb", 20.0);
    profiler.end_session(&mut session, 200, Some(120.0))
}

/// Record a bare request with the given status and duration
pub fn record_request(
    profiler: &Profiler,
    id: &str,
    metadata: RequestMetadata,
    status: u16,
    duration: f64,
) -> Profile {
    let mut session = profiler.start_session(id, metadata).unwrap();
    profiler.end_session(&mut session, status, Some(duration))
}
