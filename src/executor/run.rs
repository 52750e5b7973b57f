// src/executor/run.rs

//! Live state of one attempt's task graph.
//!
//! `AttemptRun` is a pure state machine over the attempt row and its task
//! rows: every event (start, completion, kill, tick) mutates them in place
//! and returns an [`ExecutorStep`] describing what the caller must do next.
//! It never performs IO and never reads the clock; rows it touched are
//! collected with [`AttemptRun::take_dirty`] for persistence.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use super::step::ExecutorStep;
use crate::dag::graph::dependents_of_all;
use crate::dag::TaskGraph;
use crate::errors::{FlowError, Result};
use crate::store::{AttemptRecord, TaskRecord};
use crate::types::{AttemptState, Params, TaskId, TaskState};

/// Result of one task execution as reported by an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Output parameters to merge into the attempt.
    Success(Params),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct AttemptRun {
    pub(super) attempt: AttemptRecord,
    pub(super) tasks: Vec<TaskRecord>,
    pub(super) dependents: Vec<Vec<usize>>,
    by_id: HashMap<TaskId, usize>,
    dirty: BTreeSet<usize>,
    attempt_dirty: bool,
}

impl AttemptRun {
    /// Load an attempt and its task rows (in any order).
    pub fn new(attempt: AttemptRecord, mut tasks: Vec<TaskRecord>) -> Result<Self> {
        tasks.sort_by_key(|t| t.index);
        let len = tasks.len();
        let corrupt = tasks.is_empty()
            || tasks.iter().enumerate().any(|(i, t)| {
                t.index != i
                    || t.attempt_id != attempt.id
                    || t.deps
                        .iter()
                        .chain(t.children.iter())
                        .chain(t.parent.iter())
                        .any(|&other| other >= len)
            });
        if corrupt {
            return Err(FlowError::infrastructure(format!(
                "task rows of attempt {} do not form a valid graph",
                attempt.id
            )));
        }

        let dependents = dependents_of_all(tasks.iter().map(|t| t.deps.as_slice()));
        let by_id = tasks.iter().map(|t| (t.id, t.index)).collect();
        Ok(Self {
            attempt,
            tasks,
            dependents,
            by_id,
            dirty: BTreeSet::new(),
            attempt_dirty: false,
        })
    }

    pub fn attempt(&self) -> &AttemptRecord {
        &self.attempt
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&TaskRecord> {
        self.tasks.get(index)
    }

    pub fn index_of(&self, id: TaskId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub fn is_done(&self) -> bool {
        self.attempt.done
    }

    /// Input parameters for dispatching task `index`: attempt params, then
    /// outputs exported so far, then the task's own params.
    pub fn dispatch_params(&self, index: usize) -> Params {
        let mut params = self.attempt.params.clone();
        params.extend(self.attempt.exported.clone());
        if let Some(task) = self.tasks.get(index) {
            params.extend(task.params.clone());
        }
        params
    }

    /// Move a Pending attempt to Running and compute the initial ready set.
    ///
    /// Tasks already in Success (carried over by a retry) count as satisfied
    /// dependencies and are never dispatched.
    pub fn start(&mut self, now: DateTime<Utc>) -> ExecutorStep {
        let mut step = ExecutorStep::default();
        if self.attempt.state != AttemptState::Pending {
            debug!(attempt_id = %self.attempt.id, state = %self.attempt.state, "start ignored");
            return step;
        }

        self.attempt.state = AttemptState::Running;
        self.attempt_dirty = true;
        self.try_promote(TaskGraph::ROOT, now, &mut step);
        self.settle(now, &mut step);
        info!(
            attempt_id = %self.attempt.id,
            ready = step.ready.len(),
            "attempt started"
        );
        step
    }

    /// Record that a Ready task was handed to the agent pool.
    pub fn mark_dispatched(&mut self, index: usize, now: DateTime<Utc>) {
        let Some(task) = self.tasks.get_mut(index) else {
            return;
        };
        if task.state != TaskState::Ready {
            return;
        }
        task.state = TaskState::Running;
        task.dispatched_at = Some(now);
        task.last_heartbeat = None;
        task.started_at.get_or_insert(now);
        self.dirty.insert(index);
    }

    /// Apply a completion report.
    ///
    /// Reports for tasks that are not Running (duplicates, late reports
    /// after a kill) are ignored.
    pub fn complete(
        &mut self,
        index: usize,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> ExecutorStep {
        let mut step = ExecutorStep::default();
        if !self.is_running_command(index) || self.attempt.done {
            debug!(
                attempt_id = %self.attempt.id,
                task_index = index,
                "ignoring completion for a task that is not running"
            );
            return step;
        }

        match outcome {
            TaskOutcome::Success(outputs) => {
                self.attempt.exported.extend(outputs.clone());
                self.attempt_dirty = true;

                let task = &mut self.tasks[index];
                task.state = TaskState::Success;
                task.outputs = outputs;
                task.error = None;
                task.finished_at = Some(now);
                info!(attempt_id = %self.attempt.id, task = %task.name, "task succeeded");
                self.dirty.insert(index);
                step.newly_terminal.push(index);

                for dependent in self.dependents[index].clone() {
                    self.try_promote(dependent, now, &mut step);
                }
            }
            TaskOutcome::Error(detail) => self.fail(index, detail, now, &mut step),
        }

        self.settle(now, &mut step);
        step
    }

    /// The agent confirmed it stopped a task after a kill.
    pub fn cancel_acknowledged(&mut self, index: usize, now: DateTime<Utc>) -> ExecutorStep {
        let mut step = ExecutorStep::default();
        if !self.is_running_command(index) || !self.attempt.kill_requested {
            debug!(
                attempt_id = %self.attempt.id,
                task_index = index,
                "ignoring cancel acknowledgement"
            );
            return step;
        }

        let task = &mut self.tasks[index];
        task.state = TaskState::Cancelled;
        task.finished_at = Some(now);
        info!(attempt_id = %self.attempt.id, task = %task.name, "task cancelled by agent");
        self.dirty.insert(index);
        step.newly_terminal.push(index);
        self.settle(now, &mut step);
        step
    }

    /// Refresh the liveness timestamp of a Running task.
    ///
    /// Kept in memory only: after a restart every Running task is
    /// redispatched anyway.
    pub fn heartbeat(&mut self, index: usize, now: DateTime<Utc>) {
        if self.is_running_command(index) {
            self.tasks[index].last_heartbeat = Some(now);
        }
    }

    /// Request cancellation of the whole attempt.
    ///
    /// Tasks that have not been dispatched are cancelled immediately;
    /// Running tasks are reported in `cancel_requests` and settle when the
    /// agent reports back. No-op for done or already killed attempts.
    pub fn kill(&mut self, now: DateTime<Utc>) -> ExecutorStep {
        let mut step = ExecutorStep::default();
        if self.attempt.done || self.attempt.kill_requested {
            debug!(attempt_id = %self.attempt.id, "kill is a no-op");
            return step;
        }

        self.attempt.kill_requested = true;
        self.attempt_dirty = true;
        for index in 0..self.tasks.len() {
            match self.tasks[index].state {
                TaskState::Blocked | TaskState::Ready | TaskState::RetryWaiting => {
                    self.cancel_task(index, now, &mut step);
                }
                TaskState::Running if !self.tasks[index].is_group() => {
                    step.cancel_requests.push(index);
                }
                _ => {}
            }
        }

        info!(
            attempt_id = %self.attempt.id,
            running = step.cancel_requests.len(),
            "kill requested"
        );
        self.settle(now, &mut step);
        step
    }

    /// Time-driven transitions:
    /// - RetryWaiting tasks whose `retry_at` passed become Ready;
    /// - Ready tasks (including ones whose dispatch failed) are re-offered;
    /// - Running tasks silent for longer than `heartbeat_timeout` fail.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        heartbeat_timeout: Option<TimeDelta>,
    ) -> ExecutorStep {
        let mut step = ExecutorStep::default();
        if self.attempt.done || self.attempt.state != AttemptState::Running {
            return step;
        }

        for index in 0..self.tasks.len() {
            if self.tasks[index].is_group() {
                continue;
            }
            match self.tasks[index].state {
                TaskState::RetryWaiting => {
                    let task = &mut self.tasks[index];
                    if task.retry_at.is_none_or(|at| at <= now) {
                        task.state = TaskState::Ready;
                        task.retry_at = None;
                        self.dirty.insert(index);
                        step.ready.push(index);
                    }
                }
                TaskState::Ready => {
                    if !step.ready.contains(&index) {
                        step.ready.push(index);
                    }
                }
                TaskState::Running => {
                    let Some(timeout) = heartbeat_timeout else {
                        continue;
                    };
                    let task = &self.tasks[index];
                    let last_seen = task.last_heartbeat.or(task.dispatched_at);
                    if last_seen
                        .and_then(|t| t.checked_add_signed(timeout))
                        .is_some_and(|deadline| deadline <= now)
                    {
                        step.cancel_requests.push(index);
                        let detail = format!("heartbeat timeout after {}s", timeout.num_seconds());
                        self.fail(index, detail, now, &mut step);
                    }
                }
                _ => {}
            }
        }

        self.settle(now, &mut step);
        step
    }

    /// Re-arm an attempt loaded from the store after a restart.
    ///
    /// Tasks persisted as Running lost their agent: they are redispatched
    /// without consuming retry budget, or cancelled if a kill is pending.
    pub fn recover(&mut self, now: DateTime<Utc>) -> ExecutorStep {
        if self.attempt.done {
            return ExecutorStep::default();
        }
        if self.attempt.state == AttemptState::Pending {
            return self.start(now);
        }

        let mut step = ExecutorStep::default();
        for index in 0..self.tasks.len() {
            if self.tasks[index].is_group() {
                continue;
            }
            match self.tasks[index].state {
                TaskState::Running if self.attempt.kill_requested => {
                    self.cancel_task(index, now, &mut step);
                }
                TaskState::Running => {
                    let task = &mut self.tasks[index];
                    task.state = TaskState::Ready;
                    task.dispatched_at = None;
                    self.dirty.insert(index);
                    step.ready.push(index);
                }
                TaskState::Ready => step.ready.push(index),
                _ => {}
            }
        }

        self.settle(now, &mut step);
        step
    }

    /// Rows modified since the last call.
    pub fn take_dirty(&mut self) -> (Vec<TaskRecord>, Option<AttemptRecord>) {
        let tasks = std::mem::take(&mut self.dirty)
            .into_iter()
            .map(|i| self.tasks[i].clone())
            .collect();
        let attempt = std::mem::take(&mut self.attempt_dirty).then(|| self.attempt.clone());
        (tasks, attempt)
    }

    /// Put rows returned by [`AttemptRun::take_dirty`] back after a failed
    /// write.
    pub fn keep_dirty(&mut self, tasks: &[TaskRecord], attempt: bool) {
        self.dirty.extend(tasks.iter().map(|t| t.index));
        self.attempt_dirty |= attempt;
    }

    pub(super) fn mark_dirty(&mut self, index: usize) {
        self.dirty.insert(index);
    }

    pub(super) fn mark_attempt_dirty(&mut self) {
        self.attempt_dirty = true;
    }

    fn is_running_command(&self, index: usize) -> bool {
        self.tasks
            .get(index)
            .is_some_and(|t| !t.is_group() && t.state == TaskState::Running)
    }
}
