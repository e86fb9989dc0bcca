//! Utility modules for configuration, error handling and time.

pub mod clock;
pub mod config;
pub mod error;

// Re-export commonly used error types for convenience
pub use error::{CollectorError, ConfigError, FlamegraphError, OutputError, StoreError};
