//! Configuration and constants for the profiler.
//!
//! The configuration is consumed, not owned, by the core: hosts load it from
//! a TOML file (or build it in code) and hand it to `Profiler::configure`.
//! Validation happens here, before any ingestion occurs.

use super::error::ConfigError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Current persisted profile schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Number of latest profiles returned with summary statistics
pub const SUMMARY_LATEST_LIMIT: usize = 20;

/// Number of recent profiles scanned for slow queries
pub const RECENT_QUERY_WINDOW: usize = 200;

/// Number of recent profiles scanned for cross-request hotspots
pub const HOTSPOT_WINDOW: usize = 500;

/// Number of recent profiles grouped into endpoint statistics
pub const ENDPOINT_WINDOW: usize = 1000;

/// Ranking caps per hotspot category
pub const CONTROLLER_HOTSPOT_LIMIT: usize = 10;
pub const METHOD_HOTSPOT_LIMIT: usize = 20;
pub const MODEL_HOTSPOT_LIMIT: usize = 10;
pub const VIEW_HOTSPOT_LIMIT: usize = 10;

/// Methods faster than this are left out of flame data
pub const FLAME_MIN_DURATION_MS: f64 = 0.5;

/// Statuses below this mark transport-level events, not HTTP responses
pub const MIN_HTTP_STATUS: u16 = 100;

/// Upper bound on how long a relational store waits for a connection or a
/// locked database file
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 250;

pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Largest series a single time-series read will produce
pub const MAX_TIME_BUCKETS: usize = 10_000;

/// Upper bound on `retention_days` (a century)
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Profiles per index page when a store scans its time index
pub const INDEX_SCAN_CHUNK: usize = 100;

fn default_ignored_path_prefixes() -> Vec<String> {
    ["/assets/", "/packs/", "/images/", "/javascripts/", "/stylesheets/"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

/// Which storage strategy to use, chosen once at configure time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StorageBackend {
    /// Key-value store with expiring records and a sorted time index
    TtlStore,
    /// SQLite rows with SQL aggregation and explicit purge
    Relational,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ttl_store" => Ok(StorageBackend::TtlStore),
            "relational" => Ok(StorageBackend::Relational),
            other => Err(ConfigError::InvalidBackend(other.to_string())),
        }
    }
}

impl TryFrom<String> for StorageBackend {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StorageBackend> for String {
    fn from(backend: StorageBackend) -> Self {
        backend.to_string()
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::TtlStore => write!(f, "ttl_store"),
            StorageBackend::Relational => write!(f, "relational"),
        }
    }
}

/// Profiler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub enabled: bool,
    pub sample_rate: f64,
    pub track_queries: bool,
    pub track_code: bool,
    pub track_memory: bool,
    pub retention_days: i64,
    pub storage_backend: StorageBackend,
    pub database_path: PathBuf,
    /// Application root stripped from template paths
    pub app_root: Option<PathBuf>,
    /// Dashboard mount path, never profiled itself
    pub mount_path: Option<String>,
    pub ignored_path_prefixes: Vec<String>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 0.1,
            track_queries: true,
            track_code: true,
            track_memory: false,
            retention_days: 7,
            storage_backend: StorageBackend::TtlStore,
            database_path: PathBuf::from("profiler.db"),
            app_root: None,
            mount_path: None,
            ignored_path_prefixes: default_ignored_path_prefixes(),
        }
    }
}

impl ProfilerConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults; anything else that goes wrong
    /// (unreadable file, bad TOML, invalid values) is a `ConfigError`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = contents.parse()?;
        if let Some(backend) = table.get("storage_backend").and_then(|v| v.as_str()) {
            backend.parse::<StorageBackend>()?;
        }
        let config: Self = table.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sample_rate) || self.sample_rate.is_nan() {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.retention_days <= 0 || self.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::InvalidRetention(self.retention_days));
        }
        Ok(())
    }

    /// Retention window, clamped to the largest `Duration` for
    /// configurations that skipped `validate`
    pub fn retention(&self) -> Duration {
        Duration::try_days(self.retention_days).unwrap_or(Duration::MAX)
    }
}
