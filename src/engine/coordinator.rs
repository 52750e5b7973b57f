// src/engine/coordinator.rs

//! Retry, backfill and reschedule.
//!
//! All of these validate completely before writing anything: a rejected
//! request leaves sessions, attempts and schedule cursors untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::queries::ScheduleSummary;
use super::Engine;
use crate::errors::{FlowError, Result};
use crate::store::{AttemptRecord, ScheduleRecord, SessionRecord};
use crate::timeline::SkipTarget;
use crate::types::{AttemptId, Params, RetryMode, ScheduleId, SessionId, WorkflowRef};

/// What a retry refers to: a specific attempt or the latest attempt of a
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryTarget {
    Attempt(AttemptId),
    Session(SessionId),
}

/// An attempt created (or, in dry-run, planned) by an operator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    /// `None` for planned attempts.
    pub id: Option<AttemptId>,
    /// `None` when the session does not exist yet.
    pub session_id: Option<SessionId>,
    pub session_uuid: Option<Uuid>,
    pub workflow: WorkflowRef,
    pub session_time: DateTime<Utc>,
    pub retry_attempt_name: Option<String>,
    pub params: Params,
    pub created_at: Option<DateTime<Utc>>,
}

impl AttemptSummary {
    fn created(attempt: &AttemptRecord, session: &SessionRecord) -> Self {
        Self {
            id: Some(attempt.id),
            session_id: Some(session.id),
            session_uuid: Some(session.uuid),
            workflow: attempt.workflow.clone(),
            session_time: attempt.session_time,
            retry_attempt_name: attempt.retry_attempt_name.clone(),
            params: attempt.params.clone(),
            created_at: Some(attempt.created_at),
        }
    }
}

impl Engine {
    /// Start a new named attempt of a session whose latest attempt is done.
    ///
    /// The attempt being retried is the named one for
    /// [`RetryTarget::Attempt`] and the session's latest for
    /// [`RetryTarget::Session`]. `params` default to its params; with
    /// [`RetryMode::Failed`] its successful tasks are carried over with their
    /// outputs.
    pub fn retry(
        &self,
        target: RetryTarget,
        retry_attempt_name: &str,
        mode: RetryMode,
        params: Option<Params>,
    ) -> Result<AttemptRecord> {
        if retry_attempt_name.trim().is_empty() {
            return Err(FlowError::validation("retry attempt name must not be empty"));
        }

        let (session, latest, base) = self.retry_base(target)?;
        if !latest.done {
            return Err(FlowError::conflict(format!(
                "attempt {} of session {} is still running",
                latest.id, session.id
            )));
        }

        let carried = match mode {
            RetryMode::All => None,
            RetryMode::Failed => Some(self.store.tasks_of_attempt(base.id)?),
        };
        let params = params.unwrap_or_else(|| base.params.clone());

        let attempt = self.start_attempt(
            &session,
            Some(params),
            Some(retry_attempt_name.to_string()),
            carried.as_deref(),
        )?;
        info!(
            attempt_id = %attempt.id,
            previous = %base.id,
            ?mode,
            "retry attempt started"
        );
        Ok(attempt)
    }

    /// Session of `target`, its latest attempt and the attempt to retry.
    fn retry_base(
        &self,
        target: RetryTarget,
    ) -> Result<(SessionRecord, AttemptRecord, AttemptRecord)> {
        let (session_id, named) = match target {
            RetryTarget::Attempt(id) => {
                let attempt = self
                    .store
                    .attempt(id)?
                    .ok_or_else(|| FlowError::validation(format!("unknown attempt {id}")))?;
                (attempt.session_id, Some(attempt))
            }
            RetryTarget::Session(id) => (id, None),
        };
        let session = self
            .store
            .session(session_id)?
            .ok_or_else(|| FlowError::validation(format!("unknown session {session_id}")))?;
        let latest = self
            .store
            .attempts_of_session(session.id)?
            .into_iter()
            .last()
            .ok_or_else(|| {
                FlowError::validation(format!("session {} has no attempt to retry", session.id))
            })?;
        let base = named.unwrap_or_else(|| latest.clone());
        Ok((session, latest, base))
    }

    /// Run the schedule's sessions in `[from, next_schedule_time)` as
    /// attempts named `attempt_name`.
    ///
    /// Sessions with an attempt still running are skipped. The schedule
    /// cursor never moves. With `dry_run` the same plan is returned and
    /// nothing is created.
    pub fn backfill(
        &self,
        schedule_id: ScheduleId,
        from: DateTime<Utc>,
        attempt_name: &str,
        dry_run: bool,
    ) -> Result<Vec<AttemptSummary>> {
        if attempt_name.trim().is_empty() {
            return Err(FlowError::validation("backfill attempt name must not be empty"));
        }
        let schedule = self.schedule_for_action(schedule_id)?;
        if from >= schedule.next_schedule_time {
            return Err(FlowError::validation(format!(
                "backfill start {from} must be before the next schedule time {}",
                schedule.next_schedule_time
            )));
        }
        let definition = self.workflow(&schedule.workflow)?.ok_or_else(|| {
            FlowError::validation(format!("unknown workflow {}", schedule.workflow))
        })?;

        let rule = schedule.spec.compile()?;
        let times = rule.session_times_between(from, schedule.next_schedule_time)?;

        // Check every target session before creating anything.
        let mut plan = Vec::with_capacity(times.len());
        for session_time in times {
            let session = self.registry.find(&schedule.workflow, session_time)?;
            let attempts = match &session {
                Some(s) => self.store.attempts_of_session(s.id)?,
                None => Vec::new(),
            };
            if attempts
                .iter()
                .any(|a| a.retry_attempt_name.as_deref() == Some(attempt_name))
            {
                return Err(FlowError::conflict(format!(
                    "session at {session_time} already has an attempt named '{attempt_name}'"
                )));
            }
            if attempts.iter().any(|a| !a.done) {
                info!(
                    schedule_id = %schedule_id,
                    session_time = %session_time,
                    "session has a running attempt; skipped by backfill"
                );
                continue;
            }
            plan.push((session_time, session));
        }

        if dry_run {
            return Ok(plan
                .into_iter()
                .map(|(session_time, session)| AttemptSummary {
                    id: None,
                    session_id: session.as_ref().map(|s| s.id),
                    session_uuid: session.as_ref().map(|s| s.uuid),
                    workflow: schedule.workflow.clone(),
                    session_time,
                    retry_attempt_name: Some(attempt_name.to_string()),
                    params: definition.params.clone(),
                    created_at: None,
                })
                .collect());
        }

        let mut created = Vec::with_capacity(plan.len());
        for (session_time, _) in plan {
            let (session, _) = self
                .registry
                .get_or_create_session(&schedule.workflow, session_time)?;
            match self.start_attempt(&session, None, Some(attempt_name.to_string()), None) {
                Ok(attempt) => created.push(AttemptSummary::created(&attempt, &session)),
                Err(FlowError::Conflict(detail)) => {
                    warn!(
                        schedule_id = %schedule_id,
                        session_time = %session_time,
                        %detail,
                        "session changed during backfill; skipped"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            schedule_id = %schedule_id,
            from = %from,
            attempts = created.len(),
            "backfill started"
        );
        Ok(created)
    }

    /// Move the schedule cursor forward without creating sessions for the
    /// skipped range.
    pub fn reschedule(
        &self,
        schedule_id: ScheduleId,
        next_run_time: DateTime<Utc>,
        next_schedule_time: DateTime<Utc>,
    ) -> Result<ScheduleSummary> {
        self.schedule_for_action(schedule_id)?;
        let updated = self
            .timeline
            .move_cursor(schedule_id, next_run_time, next_schedule_time)?;
        ScheduleSummary::from_record(&updated)
    }

    /// Session time belonging to a requested run time: the first session
    /// whose own run time is at or after `run_time`.
    pub fn aligned_schedule_time(
        &self,
        schedule_id: ScheduleId,
        run_time: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let schedule = self.schedule_for_action(schedule_id)?;
        let (_, session_time) = schedule.spec.compile()?.first_cursor(run_time)?;
        Ok(session_time)
    }

    /// Skip upcoming sessions of a schedule.
    pub fn skip_schedule(
        &self,
        schedule_id: ScheduleId,
        target: SkipTarget,
    ) -> Result<ScheduleSummary> {
        self.schedule_for_action(schedule_id)?;
        let (run, sched) = self.timeline.skip_cursor(schedule_id, target)?;
        self.reschedule(schedule_id, run, sched)
    }

    fn schedule_for_action(&self, schedule_id: ScheduleId) -> Result<ScheduleRecord> {
        self.store
            .schedule(schedule_id)?
            .ok_or_else(|| FlowError::validation(format!("unknown schedule {schedule_id}")))
    }
}
