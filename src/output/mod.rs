//! Output writers for profile data and flamegraphs.
//!
//! This module handles writing data to disk:
//! - JSON profiles and bulk exports (and reading them back)
//! - SVG flamegraphs

pub mod json;
pub mod svg;

// Re-export main functions
pub use json::{
    profile_to_string, read_export, read_profile, write_export, write_profile, ProfileExport,
};
pub use svg::write_svg;
