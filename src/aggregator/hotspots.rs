//! Hotspot buckets and ranking.
//!
//! A hotspot is a named aggregate of count and time within one category
//! (controllers, methods, models, views). Buckets are credited while a
//! session collects events, then ranked: descending by the category's
//! value metric, ties kept in insertion order, truncated to the category cap.

use crate::model::schema::{ActionStat, HotspotData, HotspotEntry, Hotspots};
use crate::utils::config::{
    CONTROLLER_HOTSPOT_LIMIT, METHOD_HOTSPOT_LIMIT, MODEL_HOTSPOT_LIMIT, VIEW_HOTSPOT_LIMIT,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Hotspot category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotspotKind {
    Controller,
    Method,
    Model,
    View,
}

impl HotspotKind {
    /// Maximum number of ranked entries kept
    pub fn limit(&self) -> usize {
        match self {
            HotspotKind::Controller => CONTROLLER_HOTSPOT_LIMIT,
            HotspotKind::Method => METHOD_HOTSPOT_LIMIT,
            HotspotKind::Model => MODEL_HOTSPOT_LIMIT,
            HotspotKind::View => VIEW_HOTSPOT_LIMIT,
        }
    }
}

/// Running totals for one name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HotspotBucket {
    pub count: u64,
    pub total_time: f64,
    pub exclusive_time: f64,
    pub actions: BTreeMap<String, ActionStat>,
}

impl HotspotBucket {
    /// The metric this bucket is ranked by
    fn value(&self, kind: HotspotKind) -> f64 {
        match kind {
            HotspotKind::Method => self.exclusive_time,
            _ => self.total_time,
        }
    }

    fn into_data(self, kind: HotspotKind) -> HotspotData {
        HotspotData {
            count: self.count,
            total_time: self.total_time,
            exclusive_time: (kind == HotspotKind::Method).then_some(self.exclusive_time),
            actions: (kind == HotspotKind::Controller).then_some(self.actions),
        }
    }
}

/// Buckets keyed by name, remembering first-insertion order
#[derive(Debug, Clone, Default)]
pub struct BucketMap {
    order: Vec<String>,
    buckets: HashMap<String, HotspotBucket>,
}

impl BucketMap {
    /// Bucket for `name`, created empty on first use
    pub fn entry(&mut self, name: &str) -> &mut HotspotBucket {
        if !self.buckets.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.buckets.entry(name.to_string()).or_default()
    }

    pub fn get(&self, name: &str) -> Option<&HotspotBucket> {
        self.buckets.get(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Convert into a ranked, capped entry list
    pub fn into_ranked(mut self, kind: HotspotKind) -> Vec<HotspotEntry> {
        let mut entries: Vec<HotspotEntry> = self
            .order
            .into_iter()
            .filter_map(|name| {
                let bucket = self.buckets.remove(&name)?;
                Some(HotspotEntry {
                    value: bucket.value(kind),
                    data: bucket.into_data(kind),
                    name,
                })
            })
            .collect();

        // sort_by is stable, so equal values keep insertion order
        entries.sort_by(|a, b| b.value.total_cmp(&a.value));
        entries.truncate(kind.limit());
        entries
    }
}

/// The four category maps credited during collection
#[derive(Debug, Clone, Default)]
pub struct HotspotAccumulator {
    pub controllers: BucketMap,
    pub methods: BucketMap,
    pub models: BucketMap,
    pub views: BucketMap,
}

impl HotspotAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit_controller(&mut self, controller: &str, action: Option<&str>, time: f64) {
        let bucket = self.controllers.entry(controller);
        bucket.count += 1;
        bucket.total_time += time;
        if let Some(action) = action {
            let stat = bucket.actions.entry(action.to_string()).or_default();
            stat.count += 1;
            stat.total_time += time;
        }
    }

    pub fn credit_method(&mut self, name: &str, total_time: f64, exclusive_time: f64) {
        let bucket = self.methods.entry(name);
        bucket.count += 1;
        bucket.total_time += total_time;
        bucket.exclusive_time += exclusive_time;
    }

    pub fn credit_model(&mut self, model: &str, time: f64) {
        let bucket = self.models.entry(model);
        bucket.count += 1;
        bucket.total_time += time;
    }

    pub fn credit_view(&mut self, template: &str, time: f64) {
        let bucket = self.views.entry(template);
        bucket.count += 1;
        bucket.total_time += time;
    }

    /// Fold an already-ranked entry back in (cross-profile rollups)
    pub fn absorb(&mut self, kind: HotspotKind, entry: &HotspotEntry) {
        let map = match kind {
            HotspotKind::Controller => &mut self.controllers,
            HotspotKind::Method => &mut self.methods,
            HotspotKind::Model => &mut self.models,
            HotspotKind::View => &mut self.views,
        };
        let bucket = map.entry(&entry.name);
        bucket.count += entry.data.count.max(1);
        bucket.total_time += entry.data.total_time;
        bucket.exclusive_time += entry.data.exclusive_time.unwrap_or(entry.value);
        if let Some(actions) = &entry.data.actions {
            for (action, stat) in actions {
                let merged = bucket.actions.entry(action.clone()).or_default();
                merged.count += stat.count;
                merged.total_time += stat.total_time;
            }
        }
    }

    pub fn absorb_all(&mut self, hotspots: &Hotspots) {
        for entry in &hotspots.controllers {
            self.absorb(HotspotKind::Controller, entry);
        }
        for entry in &hotspots.methods {
            self.absorb(HotspotKind::Method, entry);
        }
        for entry in &hotspots.models {
            self.absorb(HotspotKind::Model, entry);
        }
        for entry in &hotspots.views {
            self.absorb(HotspotKind::View, entry);
        }
    }

    /// Rank all four categories
    pub fn into_hotspots(self) -> Hotspots {
        Hotspots {
            controllers: self.controllers.into_ranked(HotspotKind::Controller),
            methods: self.methods.into_ranked(HotspotKind::Method),
            models: self.models.into_ranked(HotspotKind::Model),
            views: self.views.into_ranked(HotspotKind::View),
        }
    }
}

/// Normalize a template identifier into a view hotspot key
///
/// Paths under the application root are shown relative to it; anything
/// else falls back to the file name.
pub fn normalize_template(template_id: &str, app_root: Option<&Path>) -> String {
    if let Some(root) = app_root {
        if let Ok(relative) = Path::new(template_id).strip_prefix(root) {
            let relative = relative.to_string_lossy();
            if !relative.is_empty() {
                return relative.into_owned();
            }
        }
    }
    Path::new(template_id)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| template_id.to_string())
}

/// Split a qualified `Class#method` / `Class.method` name
pub fn split_qualified(name: &str) -> (&str, Option<&str>) {
    match name.rfind(['#', '.']) {
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
        None => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranking_descending_with_cap() {
        let mut acc = HotspotAccumulator::new();
        for i in 0..15 {
            acc.credit_view(&format!("view_{}", i), i as f64);
        }
        let hotspots = acc.into_hotspots();

        assert_eq!(hotspots.views.len(), 10);
        assert_eq!(hotspots.views[0].name, "view_14");
        assert!(hotspots
            .views
            .windows(2)
            .all(|pair| pair[0].value > pair[1].value));
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut acc = HotspotAccumulator::new();
        acc.credit_model("Post", 5.0);
        acc.credit_model("User", 5.0);
        acc.credit_model("Comment", 7.0);
        let models = acc.into_hotspots().models;

        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Comment", "Post", "User"]);
    }

    #[test]
    fn test_methods_ranked_by_exclusive_time() {
        let mut acc = HotspotAccumulator::new();
        acc.credit_method("A#outer", 100.0, 5.0);
        acc.credit_method("B#inner", 95.0, 95.0);
        acc.credit_method("A#outer", 50.0, 2.0);
        let methods = acc.into_hotspots().methods;

        assert_eq!(methods[0].name, "B#inner");
        assert_eq!(methods[1].data.count, 2);
        assert_eq!(methods[1].data.total_time, 150.0);
        assert_eq!(methods[1].value, 7.0);
    }

    #[test]
    fn test_controller_actions_nested() {
        let mut acc = HotspotAccumulator::new();
        acc.credit_controller("UsersController", Some("index"), 10.0);
        acc.credit_controller("UsersController", Some("show"), 4.0);
        acc.credit_controller("UsersController", Some("index"), 6.0);
        let controllers = acc.into_hotspots().controllers;

        let actions = controllers[0].data.actions.as_ref().unwrap();
        assert_eq!(controllers[0].value, 20.0);
        assert_eq!(actions["index"].count, 2);
        assert_eq!(actions["index"].total_time, 16.0);
        assert!(controllers[0].data.exclusive_time.is_none());
    }

    #[test]
    fn test_normalize_template() {
        let root = Path::new("/srv/app");
        assert_eq!(
            normalize_template("/srv/app/app/views/users/index.html.erb", Some(root)),
            "app/views/users/index.html.erb"
        );
        assert_eq!(
            normalize_template("/gems/x/views/_row.html.erb", Some(root)),
            "_row.html.erb"
        );
        assert_eq!(normalize_template("users/index", None), "index");
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split_qualified("UsersController#index"), ("UsersController", Some("index")));
        assert_eq!(split_qualified("User.find_by_email"), ("User", Some("find_by_email")));
        assert_eq!(split_qualified("helper"), ("helper", None));
    }
}
