//! Error types for the entire library.
//!
//! We use `thiserror` for library-style errors with custom types,
//! and `anyhow` for application-level error propagation in main.rs.
//!
//! Store errors never leave the storage layer: every `ProfileStore`
//! method degrades them to an empty result or a logged no-op.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are the only errors that are allowed to be fatal, and they are
/// raised at configure time, before any ingestion happens.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid storage backend: {0} (expected ttl_store or relational)")]
    InvalidBackend(String),

    #[error("Sample rate must be within [0, 1], got {0}")]
    InvalidSampleRate(f64),

    #[error("Retention must be between 1 and {max} days, got {0}", max = crate::utils::config::MAX_RETENTION_DAYS)]
    InvalidRetention(i64),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors raised by the session collector
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CollectorError {
    #[error("Session already active in this execution context: {0}")]
    DuplicateSession(String),
}

/// Errors that can occur inside a storage backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Malformed stored record {request_id}: {source}")]
    MalformedRecord {
        request_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to serialize profile: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur during flamegraph generation
#[derive(Error, Debug)]
pub enum FlamegraphError {
    #[error("Profile has no method data to render")]
    EmptyProfile,

    /// inferno reports its own XML writer error; only the message is kept
    #[error("Failed to render flamegraph: {0}")]
    Render(String),
}

/// Errors that can occur during file output
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write file: {0}")]
    WriteFailed(#[from] std::io::Error),

    #[error("Failed to serialize JSON: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("Invalid output path: {0}")]
    InvalidPath(String),
}
