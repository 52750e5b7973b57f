// src/dag/graph.rs

use crate::types::{Params, RetryPolicy};

/// One node of a compiled task graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    /// Qualified name, e.g. `+daily+load+a`.
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Nodes that must succeed before this one becomes ready.
    pub deps: Vec<usize>,
    /// `None` for groups.
    pub command: Option<String>,
    pub params: Params,
    pub retry: RetryPolicy,
}

impl TaskNode {
    pub fn is_group(&self) -> bool {
        self.command.is_none()
    }
}

/// Arena of task nodes in pre-order: index 0 is the root group and every
/// parent precedes its children.
///
/// Built (and checked for cycles) by [`super::build`]; immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    dependents: Vec<Vec<usize>>,
}

impl TaskGraph {
    pub const ROOT: usize = 0;

    pub(crate) fn from_nodes(nodes: Vec<TaskNode>) -> Self {
        let dependents = dependents_of_all(nodes.iter().map(|n| n.deps.as_slice()));
        Self { nodes, dependents }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&TaskNode> {
        self.nodes.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Nodes listing `index` in their `deps`.
    pub fn dependents_of(&self, index: usize) -> &[usize] {
        self.dependents
            .get(index)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }
}

/// Invert per-node dependency lists.
pub(crate) fn dependents_of_all<'a>(deps: impl Iterator<Item = &'a [usize]>) -> Vec<Vec<usize>> {
    let deps: Vec<&[usize]> = deps.collect();
    let mut dependents = vec![Vec::new(); deps.len()];
    for (index, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps.iter() {
            if let Some(list) = dependents.get_mut(dep) {
                list.push(index);
            }
        }
    }
    dependents
}
