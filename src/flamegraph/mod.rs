//! Flamegraph generation using the inferno library.
//!
//! This module turns a profile's call tree into:
//! - Per-method flame entries for chart widgets
//! - Interactive SVG flamegraphs
//! - A plain-text hot path table

pub mod flame;
pub mod generator;

// Re-export main types
pub use flame::{flame_entries, profile_stacks, render_svg, FlameEntry};
pub use generator::{
    generate_flamegraph, generate_text_summary, FlamegraphConfig, FlamegraphPalette,
};
