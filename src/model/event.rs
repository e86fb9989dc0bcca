//! Normalized event model.
//!
//! Instrumentation hooks emit exactly three kinds of sub-events while a
//! unit of work runs. Events are plain data and are append-only once
//! recorded.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A database query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub sql: String,
    /// Adapter-provided label, e.g. "User Load"
    pub name: Option<String>,
    /// Milliseconds
    pub duration: f64,
    /// Epoch seconds
    pub started_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<String>>,
}

/// Which layer of the application an instrumented method belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodCategory {
    Controller,
    Model,
    View,
    Job,
    Service,
    Helper,
    Other,
}

impl MethodCategory {
    /// Infer the category from a source location, falling back to the name
    ///
    /// Directory conventions win (`app/controllers/...` etc.); when the file
    /// gives nothing away the qualified name is inspected.
    pub fn infer(file: &str, name: &str) -> Self {
        if file.contains("controllers") {
            MethodCategory::Controller
        } else if file.contains("models") {
            MethodCategory::Model
        } else if file.contains("views") || name.starts_with("Render:") {
            MethodCategory::View
        } else if file.contains("jobs") {
            MethodCategory::Job
        } else if file.contains("services") {
            MethodCategory::Service
        } else if file.contains("helpers") {
            MethodCategory::Helper
        } else {
            Self::from_name(name)
        }
    }

    fn from_name(name: &str) -> Self {
        let class = name
            .split(['#', '.'])
            .next()
            .unwrap_or(name)
            .to_ascii_lowercase();
        if class.ends_with("controller") {
            MethodCategory::Controller
        } else if class.ends_with("job") {
            MethodCategory::Job
        } else if class.ends_with("service") {
            MethodCategory::Service
        } else if class.ends_with("helper") {
            MethodCategory::Helper
        } else if class.contains("template") || class.contains("render") {
            MethodCategory::View
        } else {
            MethodCategory::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MethodCategory::Controller => "controller",
            MethodCategory::Model => "model",
            MethodCategory::View => "view",
            MethodCategory::Job => "job",
            MethodCategory::Service => "service",
            MethodCategory::Helper => "helper",
            MethodCategory::Other => "other",
        }
    }
}

impl fmt::Display for MethodCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished invocation of an instrumented method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Invocation id, unique within one profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Invocation id of the frame that was on top of the stack at entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    /// Qualified name, e.g. "UsersController#index"
    pub name: String,
    pub method_name: String,
    pub category: MethodCategory,
    pub file: String,
    pub line: u32,
    /// Inclusive milliseconds
    pub duration: f64,
    /// Self time in milliseconds (children, queries and renders excluded)
    pub exclusive_duration: f64,
    /// Name of the frame that was on top of the stack at entry
    pub parent: Option<String>,
    pub started_at: f64,
    /// Kilobytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<String>>,
}

/// A template render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderEvent {
    pub template_id: String,
    pub category: String,
    pub duration: f64,
    pub started_at: f64,
}

/// Any recorded sub-event, in recording order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Query(Query),
    MethodCall(MethodCall),
    Render(RenderEvent),
}

impl Event {
    pub fn duration(&self) -> f64 {
        match self {
            Event::Query(q) => q.duration,
            Event::MethodCall(m) => m.duration,
            Event::Render(r) => r.duration,
        }
    }
}

/// What the instrumentation layer knows about a method when it enters it
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodDescriptor {
    pub name: String,
    pub method_name: String,
    pub file: String,
    pub line: u32,
    /// Explicit category; inferred from `file`/`name` when absent
    pub category: Option<MethodCategory>,
    pub backtrace: Option<Vec<String>>,
}

impl MethodDescriptor {
    /// Descriptor for a qualified `Class#method` name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let method_name = name
            .rsplit(['#', '.'])
            .next()
            .unwrap_or(&name)
            .to_string();
        Self {
            name,
            method_name,
            ..Default::default()
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }

    pub fn with_category(mut self, category: MethodCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// The explicit category, or the inferred one
    pub fn resolved_category(&self) -> MethodCategory {
        self.category
            .unwrap_or_else(|| MethodCategory::infer(&self.file, &self.name))
    }
}

/// Model names the query adapter attaches to its labels, e.g. "User Load"
const MODEL_QUERY_VERBS: &[&str] = &["Load", "Create", "Update", "Destroy", "Exists", "Count"];

/// Extract the model from a query label following the `<Model> <Verb>` convention
pub fn model_from_query_name(name: &str) -> Option<&str> {
    let (model, verb) = name.trim().rsplit_once(' ')?;
    if model.is_empty() || !MODEL_QUERY_VERBS.contains(&verb) {
        return None;
    }
    let starts_upper = model.chars().next().is_some_and(|c| c.is_ascii_uppercase());
    starts_upper.then_some(model)
}
