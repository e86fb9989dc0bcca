//! Aggregation of session events into profile structures.
//!
//! This module transforms collected events into:
//! - Ranked hotspots per category (controllers, methods, models, views)
//! - The call tree and its adjacency map
//! - Collapsed stack format (for flamegraph generation)
//! - The assembled, immutable profile

pub mod assembler;
pub mod call_graph;
pub mod hotspots;
pub mod stack_builder;

// Re-export main types and functions
pub use assembler::{derive_ruby_time, AssemblyInput, ProfileAssembler};
pub use call_graph::{build_adjacency, build_call_tree, to_view, CallGraphView};
pub use hotspots::{normalize_template, HotspotAccumulator, HotspotBucket, HotspotKind};
pub use stack_builder::{build_collapsed_stacks, CollapsedStack};
