// src/dag/definition.rs

//! Workflow definitions: the nested task tree a graph is compiled from.

use serde::{Deserialize, Serialize};

use crate::types::{Params, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    /// Default input parameters of every attempt.
    #[serde(default)]
    pub params: Params,
    /// Retry policy for tasks that don't set one (directly or via a group).
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Run the top-level tasks in parallel instead of in declared order.
    #[serde(default)]
    pub parallel: bool,
    pub tasks: Vec<TaskDefinition>,
}

/// One node of the task tree. Exactly one of `command` and `tasks` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Children run in parallel instead of in declared order.
    #[serde(default)]
    pub parallel: bool,
    /// Extra dependencies: sibling names or fully qualified names.
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            name: name.into(),
            params: Params::new(),
            retry: None,
            parallel: false,
            tasks,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }
}

impl TaskDefinition {
    /// A leaf task running `command`.
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            params: Params::new(),
            retry: None,
            parallel: false,
            after: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// A group of child tasks.
    pub fn group(name: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            name: name.into(),
            command: None,
            params: Params::new(),
            retry: None,
            parallel: false,
            after: Vec::new(),
            tasks,
        }
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.after.push(dep.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }
}
