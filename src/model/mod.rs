//! Event and profile data model.
//!
//! This module defines:
//! - The normalized sub-events recorded during a unit of work
//! - The persisted profile document and its nested hotspot/call-graph types

pub mod event;
pub mod schema;

// Re-export main types
pub use event::{
    model_from_query_name, Event, MethodCall, MethodCategory, MethodDescriptor, Query, RenderEvent,
};
pub use schema::{
    ActionStat, AdditionalData, CallGraph, CallGraphNode, HotspotData, HotspotEntry, Hotspots,
    MethodProfile, Profile, RequestMetadata, Segment,
};
