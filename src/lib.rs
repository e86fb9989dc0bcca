//! Request Profiler
//!
//! Embedded request profiling and aggregation: sampled units of work are
//! collected into sessions, assembled into immutable profiles (call graph,
//! time breakdown, ranked hotspots), persisted to a TTL key-value store or
//! a relational store, and queried for dashboards.
//!
//! ## Getting Started
//!
//! ```ignore
//! let profiler = Profiler::configure(ProfilerConfig::load("profiler.toml")?)?;
//!
//! if let Some(mut session) = profiler.begin_session(generate_request_id(), metadata)? {
//!     session.record_query("SELECT * FROM users", Some("User Load"), 4.2, started_at);
//!     {
//!         let _guard = session.enter(MethodDescriptor::new("UsersController#index"));
//!     }
//!     profiler.end_session(&mut session, 200, None);
//! }
//!
//! let stats = profiler.summary_stats();
//! ```
//!
//! The `rprof` binary inspects a relational profile database.

pub mod aggregator;
pub mod collector;
pub mod flamegraph;
pub mod model;
pub mod output;
pub mod profiler;
pub mod query;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod fixtures;

pub use collector::{generate_request_id, MethodGuard, ScopeToken, Session};
pub use model::{MethodDescriptor, Profile, RequestMetadata};
pub use profiler::Profiler;
pub use utils::config::{ProfilerConfig, StorageBackend};
