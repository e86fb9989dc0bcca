//! Profile assembly.
//!
//! Turns the state of a finished session into the immutable `Profile`
//! document: category totals and derived application time, timeline
//! segments, per-method profiles, the call graph and the ranked hotspots.

use super::call_graph::build_adjacency;
use super::hotspots::{split_qualified, HotspotAccumulator};
use crate::model::event::{Event, MethodCall, MethodCategory, Query};
use crate::model::schema::{AdditionalData, MethodProfile, Profile, RequestMetadata, Segment};
use log::debug;

/// Everything a session hands over when it finishes
#[derive(Debug, Clone)]
pub struct AssemblyInput {
    pub request_id: String,
    pub metadata: RequestMetadata,
    pub status: u16,
    /// Epoch seconds
    pub started_at: f64,
    pub duration: f64,
    pub db_time: f64,
    pub view_time: f64,
    pub controller_time: f64,
    pub events: Vec<Event>,
    pub hotspots: HotspotAccumulator,
}

/// Builds profiles from finished sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileAssembler;

impl ProfileAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Assemble a profile
    ///
    /// **Public** - called once per session, on finish
    ///
    /// # Arguments
    /// * `input` - Session state at finish time
    ///
    /// # Returns
    /// The profile, with `ruby_time = max(0, duration - db - view - controller)`
    pub fn assemble(&self, input: AssemblyInput) -> Profile {
        let AssemblyInput {
            request_id,
            metadata,
            status,
            started_at,
            duration,
            db_time,
            view_time,
            controller_time,
            events,
            mut hotspots,
        } = input;

        let ruby_time = derive_ruby_time(duration, db_time, view_time, controller_time);

        let queries: Vec<Query> = events
            .iter()
            .filter_map(|e| match e {
                Event::Query(q) => Some(q.clone()),
                _ => None,
            })
            .collect();
        let calls: Vec<MethodCall> = events
            .iter()
            .filter_map(|e| match e {
                Event::MethodCall(m) => Some(m.clone()),
                _ => None,
            })
            .collect();

        apply_fallbacks(&mut hotspots, &metadata, &calls, duration, db_time, view_time);

        let total_query_time = queries.iter().map(|q| q.duration).sum();
        let segments = build_segments(duration, db_time, view_time, controller_time, ruby_time);

        debug!(
            "[profiler] Assembled {}: {:.2}ms, {} queries, {} method calls",
            request_id,
            duration,
            queries.len(),
            calls.len()
        );

        Profile {
            request_id,
            url: metadata.url.clone(),
            method: metadata.method.clone(),
            path: metadata.path.clone(),
            controller: metadata.controller.clone(),
            action: metadata.action.clone(),
            endpoint_name: metadata.resolved_endpoint_name(),
            format: metadata.format.clone(),
            status,
            started_at,
            duration,
            db_time,
            view_time,
            controller_time,
            ruby_time,
            query_count: queries.len() as u64,
            total_query_time,
            queries,
            segments,
            additional_data: AdditionalData {
                method_profiles: build_method_profiles(&calls),
                call_graph: build_adjacency(&calls),
                hotspots: hotspots.into_hotspots(),
                events,
            },
        }
    }
}

/// Application time not attributed to any tracked category
pub fn derive_ruby_time(duration: f64, db_time: f64, view_time: f64, controller_time: f64) -> f64 {
    (duration - db_time - view_time - controller_time).max(0.0)
}

/// Fill categories left empty by collection from coarser signals
///
/// Collected buckets always win; a synthesized entry only appears when the
/// category is empty and the coarse data (known controller and action, a
/// nonzero duration) says something about it.
fn apply_fallbacks(
    hotspots: &mut HotspotAccumulator,
    metadata: &RequestMetadata,
    calls: &[MethodCall],
    duration: f64,
    db_time: f64,
    view_time: f64,
) {
    let known_action = match (&metadata.controller, &metadata.action) {
        (Some(controller), Some(action)) if duration > 0.0 => Some((controller, action)),
        _ => None,
    };

    if let Some((controller, action)) = known_action {
        if hotspots.controllers.is_empty() {
            debug!("[profiler] Synthesizing controller hotspot for {}#{}", controller, action);
            hotspots.credit_controller(controller, Some(action), duration);
        }
        if hotspots.methods.is_empty() {
            let name = format!("{}#{}", controller, action);
            let exclusive = (duration - db_time - view_time).max(0.0);
            hotspots.credit_method(&name, duration, exclusive);
        }
    }

    if hotspots.views.is_empty() {
        for call in calls.iter().filter(|c| c.category == MethodCategory::View) {
            let name = call.name.strip_prefix("Render: ").unwrap_or(&call.name);
            hotspots.credit_view(name, call.duration);
        }
    }

    if hotspots.models.is_empty() {
        for call in calls.iter().filter(|c| c.category == MethodCategory::Model) {
            let (model, _) = split_qualified(&call.name);
            hotspots.credit_model(model, call.exclusive_duration);
        }
    }
}

/// Per-method totals in first-seen order
fn build_method_profiles(calls: &[MethodCall]) -> Vec<MethodProfile> {
    let mut profiles: Vec<MethodProfile> = Vec::new();
    for call in calls {
        match profiles.iter_mut().find(|p| p.name == call.name) {
            Some(profile) => {
                profile.count += 1;
                profile.total_duration += call.duration;
                profile.exclusive_duration += call.exclusive_duration;
            }
            None => profiles.push(MethodProfile {
                name: call.name.clone(),
                category: call.category,
                count: 1,
                total_duration: call.duration,
                exclusive_duration: call.exclusive_duration,
            }),
        }
    }
    profiles
}

/// Timeline slices with their share of the total duration
fn build_segments(
    duration: f64,
    db_time: f64,
    view_time: f64,
    controller_time: f64,
    ruby_time: f64,
) -> Vec<Segment> {
    let slices = [
        ("Database", db_time, "db"),
        ("View Rendering", view_time, "view"),
        ("Controller", controller_time, "controller"),
        ("Application Code", ruby_time, "ruby"),
    ];

    slices
        .iter()
        .filter(|(_, time, _)| *time > 0.0)
        .map(|(name, time, category)| Segment {
            name: name.to_string(),
            duration: *time,
            percentage: if duration > 0.0 {
                (time / duration) * 100.0
            } else {
                0.0
            },
            category: category.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(duration: f64, db: f64, view: f64, controller: f64) -> AssemblyInput {
        AssemblyInput {
            request_id: "r1".to_string(),
            metadata: RequestMetadata::new("GET", "/users")
                .with_controller("UsersController", "index"),
            status: 200,
            started_at: 1_700_000_000.0,
            duration,
            db_time: db,
            view_time: view,
            controller_time: controller,
            events: Vec::new(),
            hotspots: HotspotAccumulator::new(),
        }
    }

    #[test]
    fn test_ruby_time_derived() {
        let profile = ProfileAssembler::new().assemble(input(120.0, 50.0, 20.0, 10.0));
        assert_eq!(profile.ruby_time, 40.0);
    }

    #[test]
    fn test_ruby_time_clamped() {
        let profile = ProfileAssembler::new().assemble(input(10.0, 50.0, 20.0, 10.0));
        assert_eq!(profile.ruby_time, 0.0);
    }

    #[test]
    fn test_segments_skip_empty_slices() {
        let profile = ProfileAssembler::new().assemble(input(100.0, 25.0, 0.0, 0.0));
        let names: Vec<&str> = profile.segments.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(names, vec!["Database", "Application Code"]);
        assert_eq!(profile.segments[0].percentage, 25.0);
        assert_eq!(profile.segments[1].category, "ruby");
    }

    #[test]
    fn test_coarse_fallback_fills_controllers() {
        let profile = ProfileAssembler::new().assemble(input(80.0, 30.0, 0.0, 0.0));
        let hotspots = &profile.additional_data.hotspots;

        assert_eq!(hotspots.controllers.len(), 1);
        assert_eq!(hotspots.controllers[0].name, "UsersController");
        assert_eq!(hotspots.controllers[0].value, 80.0);
        assert_eq!(hotspots.methods[0].name, "UsersController#index");
        assert_eq!(hotspots.methods[0].value, 50.0);
        assert_eq!(profile.endpoint_name, "UsersController#index");
    }

    #[test]
    fn test_collected_hotspots_take_priority() {
        let mut data = input(80.0, 0.0, 0.0, 0.0);
        data.hotspots.credit_controller("AdminController", Some("show"), 12.0);
        let profile = ProfileAssembler::new().assemble(data);

        let controllers = &profile.additional_data.hotspots.controllers;
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].name, "AdminController");
    }

    #[test]
    fn test_no_fallback_without_duration() {
        let profile = ProfileAssembler::new().assemble(input(0.0, 0.0, 0.0, 0.0));
        assert!(profile.additional_data.hotspots.is_empty());
    }
}
