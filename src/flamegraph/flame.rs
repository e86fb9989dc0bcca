//! Per-profile flame data.

use super::generator::{generate_flamegraph, FlamegraphConfig};
use crate::aggregator::call_graph::build_call_tree;
use crate::aggregator::stack_builder::{build_collapsed_stacks, CollapsedStack};
use crate::model::event::{Event, MethodCall, MethodCategory};
use crate::model::schema::Profile;
use crate::utils::config::FLAME_MIN_DURATION_MS;
use crate::utils::error::FlamegraphError;
use serde::Serialize;

/// One bar of the per-method flame chart
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlameEntry {
    pub name: String,
    /// Total milliseconds across calls
    pub value: f64,
    pub method_type: MethodCategory,
    pub count: u64,
}

/// Methods of a profile, heaviest first, trivial ones left out
pub fn flame_entries(profile: &Profile) -> Vec<FlameEntry> {
    let mut entries: Vec<FlameEntry> = profile
        .additional_data
        .method_profiles
        .iter()
        .filter(|m| m.total_duration >= FLAME_MIN_DURATION_MS)
        .map(|m| FlameEntry {
            name: m.name.clone(),
            value: m.total_duration,
            method_type: m.category,
            count: m.count,
        })
        .collect();
    entries.sort_by(|a, b| b.value.total_cmp(&a.value));
    entries
}

fn method_calls(profile: &Profile) -> Vec<MethodCall> {
    profile
        .additional_data
        .events
        .iter()
        .filter_map(|event| match event {
            Event::MethodCall(call) => Some(call.clone()),
            _ => None,
        })
        .collect()
}

/// Collapsed stacks for a profile's call tree
pub fn profile_stacks(profile: &Profile) -> Vec<CollapsedStack> {
    build_collapsed_stacks(&build_call_tree(&method_calls(profile)))
}

/// Render a profile's call tree as an SVG flamegraph
///
/// # Errors
/// `EmptyProfile` if the profile recorded no method time
pub fn render_svg(profile: &Profile) -> Result<String, FlamegraphError> {
    let stacks = profile_stacks(profile);
    let config = FlamegraphConfig::new().with_title(format!(
        "{} ({:.1}ms)",
        profile.endpoint_name, profile.duration
    ));
    generate_flamegraph(&stacks, Some(&config))
}
