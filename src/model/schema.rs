//! Persisted profile schema.
//!
//! This module defines the one normalized document produced by the
//! assembler and written to every store. It serializes as a flat
//! JSON-compatible structure.

use super::event::{Event, MethodCategory, Query};
use crate::utils::config::MIN_HTTP_STATUS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use crate::utils::config::SCHEMA_VERSION;

/// What the host knows about the unit of work when it begins
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub url: String,
    pub method: String,
    pub path: String,
    pub format: Option<String>,
    pub controller: Option<String>,
    pub action: Option<String>,
    pub endpoint_name: Option<String>,
}

impl RequestMetadata {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            url: path.clone(),
            method: method.into(),
            path,
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_controller(mut self, controller: impl Into<String>, action: impl Into<String>) -> Self {
        self.controller = Some(controller.into());
        self.action = Some(action.into());
        self
    }

    /// Normalized identifier used for cross-request aggregation
    ///
    /// Explicit name first, then `Controller#action`, then `METHOD path`.
    pub fn resolved_endpoint_name(&self) -> String {
        if let Some(name) = &self.endpoint_name {
            return name.clone();
        }
        match (&self.controller, &self.action) {
            (Some(controller), Some(action)) => format!("{}#{}", controller, action),
            _ => format!("{} {}", self.method, self.path),
        }
    }
}

/// A slice of the request duration used for timeline visualization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub duration: f64,
    pub percentage: f64,
    pub category: String,
}

/// Per-method totals across all invocations in one profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodProfile {
    pub name: String,
    pub category: MethodCategory,
    pub count: u64,
    pub total_duration: f64,
    pub exclusive_duration: f64,
}

/// Per-action totals nested under a controller hotspot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionStat {
    pub count: u64,
    pub total_time: f64,
}

/// The accumulated numbers behind one hotspot entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HotspotData {
    pub count: u64,
    pub total_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<BTreeMap<String, ActionStat>>,
}

/// One ranked hotspot: `value` is the category's designated metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotspotEntry {
    pub name: String,
    pub value: f64,
    pub data: HotspotData,
}

/// The four ranked hotspot lists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hotspots {
    pub controllers: Vec<HotspotEntry>,
    pub methods: Vec<HotspotEntry>,
    pub models: Vec<HotspotEntry>,
    pub views: Vec<HotspotEntry>,
}

impl Hotspots {
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
            && self.methods.is_empty()
            && self.models.is_empty()
            && self.views.is_empty()
    }
}

/// Adjacency map `caller -> {callee: invocation_count}`
pub type CallGraph = BTreeMap<String, BTreeMap<String, u64>>;

/// Everything beyond the flat request numbers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdditionalData {
    pub events: Vec<Event>,
    pub method_profiles: Vec<MethodProfile>,
    pub call_graph: CallGraph,
    pub hotspots: Hotspots,
}

/// A node of the reconstructed call tree
///
/// Invocations of the same name under the same parent are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallGraphNode {
    pub name: String,
    pub calls: u64,
    pub duration: f64,
    pub exclusive_duration: f64,
    pub children: Vec<CallGraphNode>,
}

/// Immutable summary of one finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub path: String,
    pub controller: Option<String>,
    pub action: Option<String>,
    pub endpoint_name: String,
    pub format: Option<String>,
    pub status: u16,
    /// Epoch seconds
    pub started_at: f64,
    pub duration: f64,
    pub db_time: f64,
    pub view_time: f64,
    pub controller_time: f64,
    pub ruby_time: f64,
    pub query_count: u64,
    pub total_query_time: f64,
    pub queries: Vec<Query>,
    pub segments: Vec<Segment>,
    pub additional_data: AdditionalData,
}

impl Profile {
    /// Whether this profile belongs in listings and aggregates
    pub fn is_listable(&self) -> bool {
        self.status >= MIN_HTTP_STATUS
    }
}
