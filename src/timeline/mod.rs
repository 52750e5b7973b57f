// src/timeline/mod.rs

//! Schedule timeline: each schedule's recurrence rule and its
//! `next_run_time` / `next_schedule_time` cursor.
//!
//! The cursor only moves through this type, under a per-schedule lock:
//! - [`ScheduleTimeline::advance`] after the tick registered the session for
//!   the current cursor;
//! - [`ScheduleTimeline::move_cursor`] for reschedule / skip.

pub mod rule;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{FlowError, Result};
use crate::locks::LockTable;
use crate::store::{ScheduleRecord, Store};
use crate::types::{ScheduleId, WorkflowRef};

pub use rule::{parse_clock_offset, RecurrenceSpec, ScheduleRule, ScheduleSpec};

/// How far `skip_schedule` moves a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipTarget {
    /// Skip this many upcoming sessions.
    Count(u32),
    /// Skip every session before this instant.
    To(DateTime<Utc>),
}

#[derive(Debug)]
pub struct ScheduleTimeline {
    store: Arc<dyn Store>,
    locks: LockTable<ScheduleId>,
}

impl ScheduleTimeline {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: LockTable::new(),
        }
    }

    /// Create or update the schedule of `workflow`.
    ///
    /// A new schedule, or one whose definition changed, starts at the first
    /// session whose run time is `>= now`. An unchanged definition keeps its
    /// cursor.
    pub fn declare(
        &self,
        workflow: &WorkflowRef,
        spec: &ScheduleSpec,
        now: DateTime<Utc>,
    ) -> Result<ScheduleRecord> {
        let rule = spec.compile()?;
        let existing = self
            .store
            .schedules()?
            .into_iter()
            .find(|s| s.workflow == *workflow);

        match existing {
            Some(current) if current.spec == *spec => Ok(current),
            Some(current) => {
                let id = current.id;
                self.locks.with(&id, || {
                    let (run, sched) = rule.first_cursor(now)?;
                    let updated = ScheduleRecord {
                        spec: spec.clone(),
                        next_run_time: run,
                        next_schedule_time: sched,
                        ..current
                    };
                    self.store.update_schedule(&updated)?;
                    info!(
                        schedule_id = %updated.id,
                        workflow = %workflow,
                        next_run_time = %run,
                        "schedule definition changed; cursor recomputed"
                    );
                    Ok(updated)
                })
            }
            None => {
                let (run, sched) = rule.first_cursor(now)?;
                let created = self.store.insert_schedule(ScheduleRecord {
                    id: ScheduleId(0),
                    workflow: workflow.clone(),
                    spec: spec.clone(),
                    next_run_time: run,
                    next_schedule_time: sched,
                    last_session_time: None,
                })?;
                info!(
                    schedule_id = %created.id,
                    workflow = %workflow,
                    next_run_time = %run,
                    "schedule declared"
                );
                Ok(created)
            }
        }
    }

    /// Delete the schedule of `workflow`, if any.
    pub fn remove(&self, workflow: &WorkflowRef) -> Result<()> {
        let Some(current) = self
            .store
            .schedules()?
            .into_iter()
            .find(|s| s.workflow == *workflow)
        else {
            return Ok(());
        };
        self.locks.with(&current.id, || {
            self.store.delete_schedule(current.id)?;
            info!(schedule_id = %current.id, workflow = %workflow, "schedule removed");
            Ok(())
        })
    }

    pub fn get(&self, id: ScheduleId) -> Result<ScheduleRecord> {
        self.store
            .schedule(id)?
            .ok_or_else(|| FlowError::not_found(format!("schedule {id}")))
    }

    /// Schedules whose `next_run_time <= now`, earliest first.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>> {
        let mut due: Vec<ScheduleRecord> = self
            .store
            .schedules()?
            .into_iter()
            .filter(|s| s.next_run_time <= now)
            .collect();
        due.sort_by_key(|s| (s.next_run_time, s.id));
        Ok(due)
    }

    /// Move the cursor past `session_time`.
    ///
    /// Returns `None` when the cursor no longer points at `session_time`
    /// (another tick or a reschedule already moved it), which makes a
    /// replayed tick harmless.
    pub fn advance(
        &self,
        id: ScheduleId,
        session_time: DateTime<Utc>,
    ) -> Result<Option<ScheduleRecord>> {
        self.locks.with(&id, || {
            let current = self.get(id)?;
            if current.next_schedule_time != session_time {
                debug!(
                    schedule_id = %id,
                    expected = %session_time,
                    actual = %current.next_schedule_time,
                    "cursor already moved; skipping advance"
                );
                return Ok(None);
            }

            let rule = current.spec.compile()?;
            let (run, sched) = rule.cursor_after(session_time)?;
            let updated = ScheduleRecord {
                next_run_time: run,
                next_schedule_time: sched,
                last_session_time: Some(session_time),
                ..current
            };
            self.store.update_schedule(&updated)?;
            debug!(
                schedule_id = %id,
                next_run_time = %run,
                next_schedule_time = %sched,
                "schedule advanced"
            );
            Ok(Some(updated))
        })
    }

    /// Move the cursor to an explicit point without creating sessions for the
    /// skipped range.
    ///
    /// The new run time must be strictly after the current one and the new
    /// schedule time must not be before the current one.
    pub fn move_cursor(
        &self,
        id: ScheduleId,
        next_run_time: DateTime<Utc>,
        next_schedule_time: DateTime<Utc>,
    ) -> Result<ScheduleRecord> {
        self.locks.with(&id, || {
            let current = self.get(id)?;
            if next_run_time <= current.next_run_time {
                return Err(FlowError::validation(format!(
                    "new next run time {next_run_time} must be after the current one ({})",
                    current.next_run_time
                )));
            }
            if next_schedule_time < current.next_schedule_time {
                return Err(FlowError::validation(format!(
                    "new next schedule time {next_schedule_time} is before the current one ({})",
                    current.next_schedule_time
                )));
            }

            let updated = ScheduleRecord {
                next_run_time,
                next_schedule_time,
                ..current
            };
            self.store.update_schedule(&updated)?;
            info!(
                schedule_id = %id,
                next_run_time = %next_run_time,
                next_schedule_time = %next_schedule_time,
                "schedule rescheduled"
            );
            Ok(updated)
        })
    }

    /// Cursor reached by skipping from the current one. Pure; the caller
    /// applies it with [`Self::move_cursor`].
    pub fn skip_cursor(
        &self,
        id: ScheduleId,
        target: SkipTarget,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let current = self.get(id)?;
        let rule = current.spec.compile()?;
        match target {
            SkipTarget::Count(0) => Err(FlowError::validation("skip count must be at least 1")),
            SkipTarget::Count(n) => {
                let mut sched = current.next_schedule_time;
                for _ in 0..n {
                    sched = rule.next_session_time(sched)?;
                }
                Ok((rule.run_time_of(sched)?, sched))
            }
            SkipTarget::To(time) => {
                let sched = rule.session_time_at_or_after(time)?;
                Ok((rule.run_time_of(sched)?, sched))
            }
        }
    }
}
