// src/dag/builder.rs

//! Flatten a [`WorkflowDefinition`] into a [`TaskGraph`].

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use super::definition::{TaskDefinition, WorkflowDefinition};
use super::graph::{TaskGraph, TaskNode};
use crate::errors::{FlowError, Result};
use crate::types::{Params, RetryPolicy};

/// Compile a workflow definition.
///
/// - The workflow is the root group `+<name>`; every task's qualified name
///   is its parent's name followed by `+<task>`.
/// - Children depend on their previous sibling unless the parent is
///   `parallel`.
/// - `after` entries resolve to a sibling first, then to a qualified name.
/// - Retry policies are inherited from the nearest ancestor that sets one.
///
/// Fails with `Validation` on malformed nodes, unknown references and
/// cycles.
pub fn build(def: &WorkflowDefinition) -> Result<TaskGraph> {
    check_name(&def.name)?;
    if def.tasks.is_empty() {
        return Err(FlowError::validation(format!(
            "workflow '{}' defines no tasks",
            def.name
        )));
    }

    let mut builder = Builder::default();
    let root_name = format!("+{}", def.name);
    builder.nodes.push(TaskNode {
        name: root_name.clone(),
        parent: None,
        children: Vec::new(),
        deps: Vec::new(),
        command: None,
        params: Params::new(),
        retry: def.retry.unwrap_or_else(RetryPolicy::none),
    });
    builder.after.push(Vec::new());
    builder.add_children(TaskGraph::ROOT, &root_name, &def.tasks, def.retry, def.parallel)?;
    builder.resolve_after()?;
    check_acyclic(&builder.nodes)?;

    debug!(workflow = %def.name, tasks = builder.nodes.len(), "task graph built");
    Ok(TaskGraph::from_nodes(builder.nodes))
}

#[derive(Default)]
struct Builder {
    nodes: Vec<TaskNode>,
    /// Unresolved `after` references, parallel to `nodes`.
    after: Vec<Vec<String>>,
}

impl Builder {
    fn add_children(
        &mut self,
        parent: usize,
        parent_name: &str,
        defs: &[TaskDefinition],
        inherited_retry: Option<RetryPolicy>,
        parallel: bool,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        let mut previous: Option<usize> = None;

        for def in defs {
            check_name(&def.name)?;
            let name = format!("{}+{}", parent_name, def.name);
            if !seen.insert(def.name.as_str()) {
                return Err(FlowError::validation(format!("duplicate task name '{name}'")));
            }
            match (&def.command, def.tasks.is_empty()) {
                (Some(_), false) => {
                    return Err(FlowError::validation(format!(
                        "task '{name}' has both a command and child tasks"
                    )));
                }
                (None, true) => {
                    return Err(FlowError::validation(format!(
                        "task '{name}' has neither a command nor child tasks"
                    )));
                }
                _ => {}
            }

            let retry = def.retry.or(inherited_retry);
            let index = self.nodes.len();
            let deps = match previous {
                Some(prev) if !parallel => vec![prev],
                _ => Vec::new(),
            };
            self.nodes.push(TaskNode {
                name: name.clone(),
                parent: Some(parent),
                children: Vec::new(),
                deps,
                command: def.command.clone(),
                params: def.params.clone(),
                retry: retry.unwrap_or_else(RetryPolicy::none),
            });
            self.after.push(def.after.clone());
            self.nodes[parent].children.push(index);

            if !def.tasks.is_empty() {
                self.add_children(index, &name, &def.tasks, retry, def.parallel)?;
            }
            previous = Some(index);
        }
        Ok(())
    }

    fn resolve_after(&mut self) -> Result<()> {
        for index in 0..self.nodes.len() {
            let refs = std::mem::take(&mut self.after[index]);
            for reference in refs {
                let dep = self.resolve(index, &reference).ok_or_else(|| {
                    FlowError::validation(format!(
                        "task '{}' depends on unknown task '{}'",
                        self.nodes[index].name, reference
                    ))
                })?;
                if dep == index {
                    return Err(FlowError::validation(format!(
                        "task '{}' cannot depend on itself",
                        self.nodes[index].name
                    )));
                }
                if !self.nodes[index].deps.contains(&dep) {
                    self.nodes[index].deps.push(dep);
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, index: usize, reference: &str) -> Option<usize> {
        let sibling = self.nodes[index].parent.and_then(|parent| {
            let qualified = format!("{}+{}", self.nodes[parent].name, reference);
            self.nodes[parent]
                .children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].name == qualified)
        });
        sibling.or_else(|| self.nodes.iter().position(|n| n.name == reference))
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('+') || name.contains('/') {
        return Err(FlowError::validation(format!(
            "invalid task name '{name}' (must be non-empty and contain no '+' or '/')"
        )));
    }
    Ok(())
}

/// Reject dependency cycles, including ones that only close through the
/// parent/child structure.
///
/// Every node `i` becomes two vertices, `2i` (start) and `2i + 1` (end):
/// - `start(i) -> end(i)`;
/// - `start(parent) -> start(child)` and `end(child) -> end(parent)`;
/// - `end(dep) -> start(i)` for every dependency.
fn check_acyclic(nodes: &[TaskNode]) -> Result<()> {
    let start = |i: usize| 2 * i;
    let end = |i: usize| 2 * i + 1;

    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for (i, node) in nodes.iter().enumerate() {
        graph.add_edge(start(i), end(i), ());
        if let Some(parent) = node.parent {
            graph.add_edge(start(parent), start(i), ());
            graph.add_edge(end(i), end(parent), ());
        }
        for &dep in node.deps.iter() {
            graph.add_edge(end(dep), start(i), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let node = &nodes[cycle.node_id() / 2];
            Err(FlowError::validation(format!(
                "cycle detected in task graph involving task '{}'",
                node.name
            )))
        }
    }
}
