// src/engine/attempts.rs

//! Attempt scheduler: the only code creating attempts and their task rows.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::info;

use super::{lock_run, Engine};
use crate::dag::{self, TaskGraph};
use crate::errors::{FlowError, Result};
use crate::executor::AttemptRun;
use crate::store::{AttemptRecord, SessionRecord, TaskRecord};
use crate::types::{AttemptId, AttemptState, Params, TaskId, TaskState, WorkflowRef};

impl Engine {
    /// Start the default attempt of the session at `session_time`, creating
    /// the session if needed.
    ///
    /// Fails with `Conflict` when the session already has an attempt.
    pub fn start(
        &self,
        project: &str,
        workflow: &str,
        session_time: DateTime<Utc>,
        params: Params,
    ) -> Result<AttemptRecord> {
        let workflow = WorkflowRef::new(project, workflow);
        if self.workflow(&workflow)?.is_none() {
            return Err(FlowError::validation(format!("unknown workflow {workflow}")));
        }

        let (session, _) = self.registry.get_or_create_session(&workflow, session_time)?;
        self.start_attempt(&session, Some(params), None, None)
    }

    /// Create and start an attempt of `session`.
    ///
    /// - `params` overlay the workflow's default params.
    /// - `carried` holds task rows of a previous attempt whose successes are
    ///   copied instead of re-run (retry in FAILED mode).
    ///
    /// Under the session lock: `Conflict` if the session has an attempt that
    /// is not done, or one with the same retry name (the default attempt
    /// counts as a name of its own). Nothing is written on failure.
    pub(crate) fn start_attempt(
        &self,
        session: &SessionRecord,
        params: Option<Params>,
        retry_attempt_name: Option<String>,
        carried: Option<&[TaskRecord]>,
    ) -> Result<AttemptRecord> {
        let definition = self.workflow(&session.workflow)?.ok_or_else(|| {
            FlowError::validation(format!("unknown workflow {}", session.workflow))
        })?;
        let graph = dag::build(&definition)?;

        let live = self.session_locks.with(&session.id, || {
            let existing = self.store.attempts_of_session(session.id)?;
            if let Some(active) = existing.iter().find(|a| !a.done) {
                return Err(FlowError::conflict(format!(
                    "session {} already has a running attempt ({})",
                    session.id, active.id
                )));
            }
            if existing
                .iter()
                .any(|a| a.retry_attempt_name == retry_attempt_name)
            {
                return Err(FlowError::conflict(match &retry_attempt_name {
                    Some(name) => format!(
                        "session {} already has an attempt named '{name}'",
                        session.id
                    ),
                    None => format!("session {} was already started", session.id),
                }));
            }

            let now = self.clock.now();
            let mut attempt_params = definition.params.clone();
            attempt_params.extend(params.unwrap_or_default());

            let rows = task_rows(&graph, AttemptId(0), carried);
            let exported = carried_outputs(&rows);

            let record = AttemptRecord {
                id: AttemptId(0),
                session_id: session.id,
                workflow: session.workflow.clone(),
                session_time: session.session_time,
                retry_attempt_name: retry_attempt_name.clone(),
                params: attempt_params,
                exported,
                state: AttemptState::Pending,
                done: false,
                kill_requested: false,
                created_at: now,
                finished_at: None,
            };
            let (attempt, tasks) = self.store.insert_attempt_with_tasks(record, rows)?;

            info!(
                attempt_id = %attempt.id,
                session_id = %session.id,
                workflow = %session.workflow,
                retry_attempt_name = ?attempt.retry_attempt_name,
                tasks = tasks.len(),
                "attempt created"
            );

            let run = AttemptRun::new(attempt, tasks)?;
            self.register_run(run)
        })?;

        let now = self.clock.now();
        let mut run = lock_run(&live)?;
        let step = run.start(now);
        self.apply_step(&mut run, step)?;
        Ok(run.attempt().clone())
    }
}

/// Fresh task rows for `graph`. With `carried`, tasks that succeeded in the
/// previous attempt (matched by qualified name) start as Success with their
/// outputs; a group is carried only if all its children are.
pub(crate) fn task_rows(
    graph: &TaskGraph,
    attempt_id: AttemptId,
    carried: Option<&[TaskRecord]>,
) -> Vec<TaskRecord> {
    let previous: HashMap<&str, &TaskRecord> = carried
        .unwrap_or_default()
        .iter()
        .filter(|t| t.state == TaskState::Success)
        .map(|t| (t.name.as_str(), t))
        .collect();

    let mut rows: Vec<TaskRecord> = graph
        .nodes()
        .iter()
        .enumerate()
        .map(|(index, node)| TaskRecord {
            id: TaskId(0),
            attempt_id,
            index,
            name: node.name.clone(),
            parent: node.parent,
            children: node.children.clone(),
            deps: node.deps.clone(),
            command: node.command.clone(),
            params: node.params.clone(),
            retry: node.retry,
            state: TaskState::Blocked,
            retry_count: 0,
            retry_at: None,
            dispatched_at: None,
            last_heartbeat: None,
            error: None,
            outputs: Params::new(),
            started_at: None,
            finished_at: None,
        })
        .collect();

    // Children follow their parents, so walking backwards settles leaves
    // before the groups that contain them.
    for index in (0..rows.len()).rev() {
        let Some(prev) = previous.get(rows[index].name.as_str()) else {
            continue;
        };
        let children_carried = rows[index]
            .children
            .iter()
            .all(|&c| rows[c].state == TaskState::Success);
        if rows[index].is_group() != prev.is_group() || !children_carried {
            continue;
        }
        let row = &mut rows[index];
        row.state = TaskState::Success;
        row.outputs = prev.outputs.clone();
        row.started_at = prev.started_at;
        row.finished_at = prev.finished_at;
    }
    rows
}

/// Outputs of carried-over tasks, in task order.
fn carried_outputs(rows: &[TaskRecord]) -> Params {
    let mut exported = Params::new();
    for row in rows.iter().filter(|r| r.state == TaskState::Success) {
        exported.extend(row.outputs.clone());
    }
    exported
}
