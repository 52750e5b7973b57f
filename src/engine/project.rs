// src/engine/project.rs

//! Applying a project revision: workflow definitions plus their schedules.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::Engine;
use crate::dag::{self, WorkflowDefinition};
use crate::errors::{FlowError, Result};
use crate::timeline::ScheduleSpec;
use crate::types::WorkflowRef;

/// A deployable set of workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDefinition {
    pub name: String,
    pub workflows: Vec<WorkflowEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEntry {
    pub definition: WorkflowDefinition,
    /// Unscheduled workflows only run through `start`.
    pub schedule: Option<ScheduleSpec>,
}

impl Engine {
    /// Register every workflow of `project` and sync its schedules.
    ///
    /// The whole revision is validated first; on error nothing changes.
    /// Schedules of this project's workflows that are gone or no longer
    /// scheduled are removed. An unchanged schedule keeps its cursor.
    pub fn apply_project(&self, project: &ProjectDefinition) -> Result<()> {
        let mut names = HashSet::new();
        for entry in &project.workflows {
            if !names.insert(entry.definition.name.as_str()) {
                return Err(FlowError::validation(format!(
                    "workflow '{}' is defined twice",
                    entry.definition.name
                )));
            }
            dag::build(&entry.definition)?;
            if let Some(spec) = &entry.schedule {
                spec.compile()?;
            }
        }

        let now = self.clock.now();
        {
            let mut workflows = self
                .workflows
                .write()
                .map_err(|_| FlowError::infrastructure("workflow table poisoned"))?;
            workflows.retain(|wf, _| wf.project != project.name);
            for entry in &project.workflows {
                workflows.insert(
                    WorkflowRef::new(&project.name, &entry.definition.name),
                    entry.definition.clone(),
                );
            }
        }

        let mut scheduled = HashSet::new();
        for entry in &project.workflows {
            let Some(spec) = &entry.schedule else {
                continue;
            };
            let workflow = WorkflowRef::new(&project.name, &entry.definition.name);
            self.timeline.declare(&workflow, spec, now)?;
            scheduled.insert(workflow);
        }

        for schedule in self.store.schedules()? {
            if schedule.workflow.project == project.name && !scheduled.contains(&schedule.workflow)
            {
                self.timeline.remove(&schedule.workflow)?;
            }
        }

        info!(
            project = %project.name,
            workflows = project.workflows.len(),
            schedules = scheduled.len(),
            "project applied"
        );
        Ok(())
    }
}
