// src/executor/propagation.rs

//! State propagation through the task graph: readiness, failure, cancellation
//! and group settlement.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use super::run::AttemptRun;
use super::step::ExecutorStep;
use crate::dag::TaskGraph;
use crate::errors::FlowError;
use crate::types::{AttemptState, TaskState};

impl AttemptRun {
    /// Promote a Blocked task whose dependencies all succeeded and whose
    /// parent is Running. Groups start running in place and promote their
    /// children; command tasks become Ready.
    pub(super) fn try_promote(&mut self, index: usize, now: DateTime<Utc>, step: &mut ExecutorStep) {
        let task = &self.tasks[index];
        if task.state != TaskState::Blocked {
            return;
        }
        if let Some(parent) = task.parent {
            if self.tasks[parent].state != TaskState::Running {
                return;
            }
        }
        if !task
            .deps
            .iter()
            .all(|&dep| self.tasks[dep].state == TaskState::Success)
        {
            return;
        }

        if task.is_group() {
            let children = task.children.clone();
            let task = &mut self.tasks[index];
            task.state = TaskState::Running;
            task.started_at = Some(now);
            debug!(attempt_id = %self.attempt.id, task = %task.name, "group started");
            self.mark_dirty(index);
            for child in children {
                self.try_promote(child, now, step);
            }
        } else {
            self.tasks[index].state = TaskState::Ready;
            self.mark_dirty(index);
            step.ready.push(index);
        }
    }

    /// Handle a failed execution: schedule a retry while budget remains,
    /// otherwise mark the task Error and cancel everything downstream.
    pub(super) fn fail(
        &mut self,
        index: usize,
        detail: String,
        now: DateTime<Utc>,
        step: &mut ExecutorStep,
    ) {
        let attempt_id = self.attempt.id;
        let kill_requested = self.attempt.kill_requested;
        let task = &mut self.tasks[index];
        task.error = Some(detail.clone());

        if !kill_requested && task.retry_count < task.retry.limit {
            task.retry_count += 1;
            let wait = TimeDelta::from_std(task.retry.backoff(task.retry_count))
                .unwrap_or(TimeDelta::MAX);
            let at = now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC);
            warn!(
                attempt_id = %attempt_id,
                task = %task.name,
                retry_count = task.retry_count,
                retry_at = %at,
                error = %FlowError::TransientExecution(detail),
                "task failed; retry scheduled"
            );
            step.retry_scheduled.push(index);
            if at <= now {
                task.state = TaskState::Ready;
                task.retry_at = None;
                step.ready.push(index);
            } else {
                task.state = TaskState::RetryWaiting;
                task.retry_at = Some(at);
            }
            self.mark_dirty(index);
            return;
        }

        task.state = TaskState::Error;
        task.finished_at = Some(now);
        error!(
            attempt_id = %attempt_id,
            task = %task.name,
            error = %FlowError::FatalExecution(detail),
            "task failed"
        );
        self.mark_dirty(index);
        step.newly_terminal.push(index);
        self.cancel_downstream(index, now, step);
    }

    /// Cancel a not-yet-finished task that is not Running.
    pub(super) fn cancel_task(&mut self, index: usize, now: DateTime<Utc>, step: &mut ExecutorStep) {
        let task = &mut self.tasks[index];
        task.state = TaskState::Cancelled;
        task.retry_at = None;
        task.finished_at = Some(now);
        self.mark_dirty(index);
        step.newly_terminal.push(index);
        step.ready.retain(|&r| r != index);
    }

    /// Cancel every task that can no longer run because `index` did not
    /// succeed: its transitive dependents and everything nested below them.
    pub(super) fn cancel_downstream(
        &mut self,
        index: usize,
        now: DateTime<Utc>,
        step: &mut ExecutorStep,
    ) {
        let mut pending: Vec<usize> = self.dependents[index].clone();
        while let Some(next) = pending.pop() {
            match self.tasks[next].state {
                TaskState::Blocked | TaskState::Ready | TaskState::RetryWaiting => {
                    self.cancel_task(next, now, step);
                    debug!(
                        attempt_id = %self.attempt.id,
                        task = %self.tasks[next].name,
                        "cancelled by upstream failure"
                    );
                    pending.extend(self.dependents[next].iter().copied());
                    pending.extend(self.tasks[next].children.iter().copied());
                }
                _ => {}
            }
        }
    }

    /// Settle Running groups whose children are all terminal, deepest first,
    /// until nothing changes; then finish the attempt if the root settled.
    ///
    /// A group succeeds when every child succeeded, fails when any child
    /// failed and is cancelled otherwise.
    pub(super) fn settle(&mut self, now: DateTime<Utc>, step: &mut ExecutorStep) {
        loop {
            let mut changed = false;
            for index in (0..self.tasks.len()).rev() {
                let task = &self.tasks[index];
                if !task.is_group() || task.state != TaskState::Running {
                    continue;
                }
                let states: Vec<TaskState> =
                    task.children.iter().map(|&c| self.tasks[c].state).collect();
                if states.iter().any(|s| !s.is_terminal()) {
                    continue;
                }

                let settled = if states.iter().all(|s| *s == TaskState::Success) {
                    TaskState::Success
                } else if states.contains(&TaskState::Error) {
                    TaskState::Error
                } else {
                    TaskState::Cancelled
                };

                let task = &mut self.tasks[index];
                task.state = settled;
                task.finished_at = Some(now);
                debug!(attempt_id = %self.attempt.id, task = %task.name, state = %settled, "group settled");
                self.mark_dirty(index);
                step.newly_terminal.push(index);
                changed = true;

                if settled == TaskState::Success {
                    for dependent in self.dependents[index].clone() {
                        self.try_promote(dependent, now, step);
                    }
                } else {
                    self.cancel_downstream(index, now, step);
                }
            }
            if !changed {
                break;
            }
        }

        self.finish_if_settled(now, step);
    }

    fn finish_if_settled(&mut self, now: DateTime<Utc>, step: &mut ExecutorStep) {
        if self.attempt.done || !self.tasks[TaskGraph::ROOT].state.is_terminal() {
            return;
        }

        let state = if self.attempt.kill_requested {
            AttemptState::Killed
        } else if self.tasks[TaskGraph::ROOT].state == TaskState::Success {
            AttemptState::Success
        } else {
            AttemptState::Error
        };

        self.attempt.state = state;
        self.attempt.done = true;
        self.attempt.finished_at = Some(now);
        self.mark_attempt_dirty();
        step.attempt_finished = Some(state);
        info!(attempt_id = %self.attempt.id, state = %state, "attempt finished");
    }
}
