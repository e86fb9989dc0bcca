//! Build collapsed stack format from a reconstructed call tree.
//!
//! Collapsed stacks are the input format for flamegraph generation.
//! Format: "parent;child;grandchild weight"
//!
//! Example: "UsersController#index;User.active;Render:_users/index 1500"
//! This means: index called User.active which rendered a template, spending
//! 1500µs of self time in the innermost frame.

use crate::model::schema::CallGraphNode;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single collapsed stack entry
///
/// **Public** - used by flamegraph generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollapsedStack {
    /// Stack trace as semicolon-separated string
    pub stack: String,

    /// Weight (exclusive microseconds spent in the innermost frame)
    pub weight: u64,
}

impl CollapsedStack {
    /// Create a new collapsed stack
    pub fn new(stack: String, weight: u64) -> Self {
        Self { stack, weight }
    }

    /// Render as one line of folded input
    pub fn to_line(&self) -> String {
        format!("{} {}", self.stack, self.weight)
    }
}

/// Build collapsed stacks from a call tree
///
/// **Public** - main entry point for stack building
///
/// # Arguments
/// * `roots` - Call tree from `build_call_tree`
///
/// # Returns
/// Vector of collapsed stacks, one per unique path, heaviest first.
/// Frames with zero self time are left out.
///
/// # Algorithm
/// 1. Walk the tree depth-first, carrying the path
/// 2. Weight each path by the node's exclusive time in µs
/// 3. Aggregate by unique stack (sum weights)
pub fn build_collapsed_stacks(roots: &[CallGraphNode]) -> Vec<CollapsedStack> {
    let mut stack_map: HashMap<String, u64> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    for root in roots {
        collect(root, &mut path, &mut stack_map);
    }

    let mut stacks: Vec<CollapsedStack> = stack_map
        .into_iter()
        .filter(|(_, weight)| *weight > 0)
        .map(|(stack, weight)| CollapsedStack::new(stack, weight))
        .collect();

    stacks.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.stack.cmp(&b.stack)));
    debug!("Built {} unique collapsed stacks", stacks.len());

    stacks
}

fn collect<'a>(node: &'a CallGraphNode, path: &mut Vec<&'a str>, out: &mut HashMap<String, u64>) {
    path.push(&node.name);

    let weight = (node.exclusive_duration.max(0.0) * 1000.0).round() as u64;
    *out.entry(sanitize(&path.join(";"))).or_insert(0) += weight;

    for child in &node.children {
        collect(child, path, out);
    }

    path.pop();
}

/// Folded format reserves the space before the weight
fn sanitize(stack: &str) -> String {
    stack.replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, exclusive: f64, children: Vec<CallGraphNode>) -> CallGraphNode {
        CallGraphNode {
            name: name.to_string(),
            calls: 1,
            duration: exclusive,
            exclusive_duration: exclusive,
            children,
        }
    }

    #[test]
    fn test_stacks_follow_tree() {
        let tree = vec![node(
            "A",
            1.0,
            vec![node("B", 2.5, vec![node("C", 0.0, vec![])])],
        )];
        let stacks = build_collapsed_stacks(&tree);

        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0], CollapsedStack::new("A;B".to_string(), 2500));
        assert_eq!(stacks[1].to_line(), "A 1000");
    }

    #[test]
    fn test_spaces_are_folded() {
        let tree = vec![node("Render: users/index", 1.0, vec![])];
        let stacks = build_collapsed_stacks(&tree);
        assert_eq!(stacks[0].stack, "Render:_users/index");
    }
}
