//! CLI command implementations.
//!
//! Read-only reports live in `inspect`, database changes and exports in
//! `maintain`. Commands orchestrate the library components and print.

pub mod inspect;
pub mod maintain;
pub mod utils;

// Re-export main command functions
pub use inspect::open_engine;
pub use utils::{display_schema, display_version, validate_profile_file};
