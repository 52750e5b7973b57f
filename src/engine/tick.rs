// src/engine/tick.rs

//! The periodic tick: fire due schedules, then advance live attempts
//! (retry timers, dispatch retries, heartbeat timeouts).

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::{lock_run, Engine};
use crate::errors::{FlowError, Result};
use crate::store::{RecordFilter, ScheduleRecord};
use crate::types::AttemptId;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Attempts started for due sessions.
    pub started: Vec<AttemptId>,
    /// Sessions found already started (replayed tick).
    pub already_started: usize,
    /// Sessions skipped because the previous one was still running.
    pub skipped_overtime: usize,
    /// Schedules left behind because of an error; retried next tick.
    pub failed_schedules: usize,
}

enum Fired {
    Started(AttemptId),
    AlreadyStarted,
    SkippedOvertime,
}

impl Engine {
    /// Evaluate the timeline at `now`.
    ///
    /// Each due schedule fires its sessions in order, up to
    /// `max_catchup_ticks` per tick. The cursor moves past a session only
    /// after the session and its attempt are stored, so a crash between the
    /// two makes the next tick find the session already started.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        for due in self.timeline.due_schedules(now)? {
            self.catch_up(due, now, &mut report);
        }

        for live in self.live_runs()? {
            let mut run = lock_run(&live)?;
            let step = run.tick(now, self.heartbeat_timeout());
            if let Err(e) = self.apply_step(&mut run, step) {
                error!(attempt_id = %run.attempt().id, error = %e, "failed to advance attempt");
            }
        }

        if !report.started.is_empty() || report.skipped_overtime > 0 {
            info!(
                started = report.started.len(),
                skipped = report.skipped_overtime,
                "tick fired schedules"
            );
        }
        Ok(report)
    }

    fn catch_up(&self, mut schedule: ScheduleRecord, now: DateTime<Utc>, report: &mut TickReport) {
        for _ in 0..self.settings.max_catchup_ticks.max(1) {
            if schedule.next_run_time > now {
                return;
            }
            let session_time = schedule.next_schedule_time;

            match self.fire(&schedule) {
                Ok(Fired::Started(id)) => report.started.push(id),
                Ok(Fired::AlreadyStarted) => report.already_started += 1,
                Ok(Fired::SkippedOvertime) => report.skipped_overtime += 1,
                Err(e) => {
                    error!(
                        schedule_id = %schedule.id,
                        workflow = %schedule.workflow,
                        session_time = %session_time,
                        error = %e,
                        "failed to fire schedule"
                    );
                    report.failed_schedules += 1;
                    return;
                }
            }

            match self.timeline.advance(schedule.id, session_time) {
                Ok(Some(updated)) => schedule = updated,
                Ok(None) => return,
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "failed to advance schedule");
                    report.failed_schedules += 1;
                    return;
                }
            }
        }
        if schedule.next_run_time <= now {
            warn!(
                schedule_id = %schedule.id,
                next_run_time = %schedule.next_run_time,
                "catch-up limit reached; continuing next tick"
            );
        }
    }

    /// Register the session at the schedule's cursor and start its attempt.
    fn fire(&self, schedule: &ScheduleRecord) -> Result<Fired> {
        let rule = schedule.spec.compile()?;
        if rule.skip_on_overtime() && self.previous_still_running(schedule)? {
            info!(
                schedule_id = %schedule.id,
                session_time = %schedule.next_schedule_time,
                "previous session still running; skipping"
            );
            return Ok(Fired::SkippedOvertime);
        }

        if self.workflow(&schedule.workflow)?.is_none() {
            return Err(FlowError::validation(format!(
                "schedule refers to unknown workflow {}",
                schedule.workflow
            )));
        }

        let (session, _) = self
            .registry
            .get_or_create_session(&schedule.workflow, schedule.next_schedule_time)?;
        match self.start_attempt(&session, None, None, None) {
            Ok(attempt) => Ok(Fired::Started(attempt.id)),
            Err(FlowError::Conflict(detail)) => {
                debug!(session_id = %session.id, %detail, "session already started");
                Ok(Fired::AlreadyStarted)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a scheduled (unnamed) attempt of the workflow is running.
    fn previous_still_running(&self, schedule: &ScheduleRecord) -> Result<bool> {
        let filter = RecordFilter::for_workflow(&schedule.workflow);
        Ok(self
            .store
            .attempts(&filter)?
            .iter()
            .any(|a| !a.done && a.retry_attempt_name.is_none()))
    }
}
