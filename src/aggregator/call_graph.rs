//! Call graph reconstruction from method-call events.
//!
//! Each call carries its own invocation id and the id of the frame below it
//! on the stack, so the tree is rebuilt invocation by invocation and sibling
//! calls sharing a name are merged afterwards. A callee reached from two
//! callers therefore shows up once under each, with only that caller's time.
//!
//! Calls recorded without ids fall back to grouping by parent name, where a
//! name's children are attached at its first placement only.
//!
//! Stack discipline rules out cycles for live data, but stored or replayed
//! data may contain them: a back-edge is dropped with a warning, and calls
//! only reachable through a cycle are promoted to roots.

use crate::model::event::MethodCall;
use crate::model::schema::{CallGraph, CallGraphNode};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Calls sharing one (parent, name) pair
#[derive(Debug, Clone)]
struct Group<'a> {
    name: &'a str,
    calls: u64,
    duration: f64,
    exclusive_duration: f64,
}

fn merge_into<'a>(groups: &mut Vec<Group<'a>>, call: &'a MethodCall) {
    match groups.iter_mut().find(|g| g.name == call.name) {
        Some(group) => {
            group.calls += 1;
            group.duration += call.duration;
            group.exclusive_duration += call.exclusive_duration;
        }
        None => groups.push(Group {
            name: &call.name,
            calls: 1,
            duration: call.duration,
            exclusive_duration: call.exclusive_duration,
        }),
    }
}

struct TreeBuilder<'a> {
    children: HashMap<&'a str, Vec<Group<'a>>>,
    visited: HashSet<&'a str>,
}

impl<'a> TreeBuilder<'a> {
    fn build(&mut self, group: &Group<'a>, path: &mut Vec<&'a str>) -> CallGraphNode {
        let first_placement = self.visited.insert(group.name);
        path.push(group.name);

        let child_groups = if first_placement {
            self.children.get(group.name).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut children = Vec::with_capacity(child_groups.len());
        for child in &child_groups {
            if path.contains(&child.name) {
                warn!(
                    "[profiler] Call graph cycle: {} -> {} (path {}), dropping edge",
                    group.name,
                    child.name,
                    path.join(" -> ")
                );
                continue;
            }
            children.push(self.build(child, path));
        }

        path.pop();
        CallGraphNode {
            name: group.name.to_string(),
            calls: group.calls,
            duration: group.duration,
            exclusive_duration: group.exclusive_duration,
            children,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Invocation<'a> {
    id: u64,
    call: &'a MethodCall,
}

/// Split invocations into same-name groups, in first-seen order
fn group_by_name<'a>(invocations: &[Invocation<'a>]) -> Vec<(&'a str, Vec<Invocation<'a>>)> {
    let mut groups: Vec<(&'a str, Vec<Invocation<'a>>)> = Vec::new();
    for invocation in invocations {
        let name = invocation.call.name.as_str();
        match groups.iter_mut().find(|(group, _)| *group == name) {
            Some((_, members)) => members.push(*invocation),
            None => groups.push((name, vec![*invocation])),
        }
    }
    groups
}

struct InvocationTree<'a> {
    children: HashMap<u64, Vec<Invocation<'a>>>,
    placed: HashSet<u64>,
}

impl<'a> InvocationTree<'a> {
    /// Build one merged node; `members` must already be marked placed
    fn build(&mut self, name: &'a str, members: &[Invocation<'a>]) -> CallGraphNode {
        let mut nested = Vec::new();
        for member in members {
            for child in self.children.get(&member.id).into_iter().flatten() {
                if !self.placed.insert(child.id) {
                    warn!(
                        "[profiler] Call graph cycle: {} -> {} (invocation {}), dropping edge",
                        name, child.call.name, child.id
                    );
                    continue;
                }
                nested.push(*child);
            }
        }

        let children = group_by_name(&nested)
            .into_iter()
            .map(|(child_name, child_members)| self.build(child_name, &child_members))
            .collect();

        CallGraphNode {
            name: name.to_string(),
            calls: members.len() as u64,
            duration: members.iter().map(|m| m.call.duration).sum(),
            exclusive_duration: members.iter().map(|m| m.call.exclusive_duration).sum(),
            children,
        }
    }
}

fn build_from_invocations(invocations: &[Invocation<'_>]) -> Vec<CallGraphNode> {
    let known: HashSet<u64> = invocations.iter().map(|i| i.id).collect();

    let mut roots = Vec::new();
    let mut children: HashMap<u64, Vec<Invocation>> = HashMap::new();
    for invocation in invocations {
        match invocation.call.parent_id {
            Some(parent) if known.contains(&parent) => {
                children.entry(parent).or_default().push(*invocation)
            }
            Some(parent) => {
                debug!(
                    "[profiler] Parent invocation {} of {} was never recorded",
                    parent, invocation.call.name
                );
                roots.push(*invocation);
            }
            None => roots.push(*invocation),
        }
    }

    let mut tree = InvocationTree {
        children,
        placed: roots.iter().map(|root| root.id).collect(),
    };
    let mut nodes: Vec<CallGraphNode> = group_by_name(&roots)
        .into_iter()
        .map(|(name, members)| tree.build(name, &members))
        .collect();

    // Invocations still unplaced are only reachable through a cycle
    for invocation in invocations {
        if !tree.placed.insert(invocation.id) {
            continue;
        }
        warn!(
            "[profiler] {} (invocation {}) is unreachable from any root, promoting to root",
            invocation.call.name, invocation.id
        );
        nodes.push(tree.build(&invocation.call.name, &[*invocation]));
    }

    nodes
}

/// Rebuild the call tree
///
/// **Public** - used by the assembler, the flamegraph and the CLI
///
/// # Arguments
/// * `calls` - Method-call events in recording order
///
/// # Returns
/// Root nodes in first-seen order. Calls whose parent was never recorded
/// are treated as roots too.
pub fn build_call_tree(calls: &[MethodCall]) -> Vec<CallGraphNode> {
    let invocations: Option<Vec<Invocation>> = calls
        .iter()
        .map(|call| call.id.map(|id| Invocation { id, call }))
        .collect();
    match invocations {
        Some(invocations) => build_from_invocations(&invocations),
        None => build_by_parent_name(calls),
    }
}

fn build_by_parent_name(calls: &[MethodCall]) -> Vec<CallGraphNode> {
    let known: HashSet<&str> = calls.iter().map(|c| c.name.as_str()).collect();

    let mut roots: Vec<Group> = Vec::new();
    let mut children: HashMap<&str, Vec<Group>> = HashMap::new();
    for call in calls {
        match call.parent.as_deref() {
            Some(parent) if known.contains(parent) => {
                merge_into(children.entry(parent).or_default(), call)
            }
            Some(parent) => {
                debug!("[profiler] Parent {} of {} was never recorded", parent, call.name);
                merge_into(&mut roots, call);
            }
            None => merge_into(&mut roots, call),
        }
    }

    let mut builder = TreeBuilder {
        children,
        visited: HashSet::new(),
    };

    let mut tree: Vec<CallGraphNode> = roots
        .iter()
        .map(|root| builder.build(root, &mut Vec::new()))
        .collect();

    // Names still unvisited are only reachable through a cycle
    for call in calls {
        if builder.visited.contains(call.name.as_str()) {
            continue;
        }
        warn!(
            "[profiler] {} is unreachable from any root (cyclic parentage), promoting to root",
            call.name
        );
        let mut promoted: Vec<Group> = Vec::new();
        for same in calls.iter().filter(|c| c.name == call.name) {
            merge_into(&mut promoted, same);
        }
        if let Some(group) = promoted.first() {
            tree.push(builder.build(group, &mut Vec::new()));
        }
    }

    tree
}

/// Adjacency map `caller -> {callee: invocation_count}`
pub fn build_adjacency(calls: &[MethodCall]) -> CallGraph {
    let mut graph = CallGraph::new();
    for call in calls {
        if let Some(parent) = &call.parent {
            *graph
                .entry(parent.clone())
                .or_default()
                .entry(call.name.clone())
                .or_insert(0) += 1;
        }
    }
    graph
}

/// Node/link form of the adjacency map for graph visualizations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallGraphView {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    /// Method part of the qualified name
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphLink {
    pub source: usize,
    pub target: usize,
    pub value: u64,
}

/// Flatten an adjacency map into indexed nodes and weighted links
pub fn to_view(graph: &CallGraph) -> CallGraphView {
    let mut view = CallGraphView {
        nodes: Vec::new(),
        links: Vec::new(),
    };
    let mut index: HashMap<&str, usize> = HashMap::new();

    for (caller, callees) in graph {
        let source = node_index(&mut view.nodes, &mut index, caller);
        for (callee, count) in callees {
            let target = node_index(&mut view.nodes, &mut index, callee);
            view.links.push(GraphLink {
                source,
                target,
                value: *count,
            });
        }
    }

    view
}

fn node_index<'a>(
    nodes: &mut Vec<GraphNode>,
    index: &mut HashMap<&'a str, usize>,
    name: &'a str,
) -> usize {
    *index.entry(name).or_insert_with(|| {
        nodes.push(GraphNode {
            id: name.to_string(),
            name: name.rsplit('#').next().unwrap_or(name).to_string(),
        });
        nodes.len() - 1
    })
}
