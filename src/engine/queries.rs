// src/engine/queries.rs

//! Read-only views for operators.

use std::io::Read;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::Engine;
use crate::errors::{FlowError, Result};
use crate::storage::{attempt_log_prefix, parse_task_log_key};
use crate::store::{AttemptRecord, RecordFilter, ScheduleRecord, SessionRecord, TaskRecord};
use crate::types::{AttemptId, ScheduleId, SessionId, WorkflowRef};

/// A schedule and its cursor, as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSummary {
    pub id: ScheduleId,
    pub workflow: WorkflowRef,
    pub timezone: String,
    pub next_run_time: DateTime<Utc>,
    /// Session time of the next session, in the schedule's timezone.
    pub next_schedule_time: String,
}

impl ScheduleSummary {
    pub fn from_record(record: &ScheduleRecord) -> Result<Self> {
        let tz = record.spec.compile()?.timezone();
        Ok(Self {
            id: record.id,
            workflow: record.workflow.clone(),
            timezone: tz.name().to_string(),
            next_run_time: record.next_run_time,
            next_schedule_time: record.next_schedule_time.with_timezone(&tz).to_rfc3339(),
        })
    }
}

/// Captured output of one task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_name: String,
    pub key: String,
    pub started_at: Option<DateTime<Utc>>,
    pub content: String,
}

impl Engine {
    pub fn schedule(&self, id: ScheduleId) -> Result<ScheduleSummary> {
        ScheduleSummary::from_record(&self.timeline.get(id)?)
    }

    pub fn schedules(&self) -> Result<Vec<ScheduleSummary>> {
        self.store
            .schedules()?
            .iter()
            .map(ScheduleSummary::from_record)
            .collect()
    }

    pub fn session(&self, id: SessionId) -> Result<SessionRecord> {
        self.store
            .session(id)?
            .ok_or_else(|| FlowError::not_found(format!("session {id}")))
    }

    pub fn sessions(&self, filter: &RecordFilter) -> Result<Vec<SessionRecord>> {
        self.store.sessions(filter)
    }

    pub fn attempt(&self, id: AttemptId) -> Result<AttemptRecord> {
        self.store
            .attempt(id)?
            .ok_or_else(|| FlowError::not_found(format!("attempt {id}")))
    }

    pub fn attempts(&self, filter: &RecordFilter) -> Result<Vec<AttemptRecord>> {
        self.store.attempts(filter)
    }

    pub fn tasks(&self, attempt_id: AttemptId) -> Result<Vec<TaskRecord>> {
        self.attempt(attempt_id)?;
        self.store.tasks_of_attempt(attempt_id)
    }

    /// Logs of every task run of an attempt, ordered by task name and start
    /// time.
    pub fn task_logs(&self, attempt_id: AttemptId) -> Result<Vec<TaskLog>> {
        self.attempt(attempt_id)?;

        let mut keys = Vec::new();
        self.storage
            .list(&attempt_log_prefix(attempt_id), &mut |chunk| {
                keys.extend(chunk.into_iter().map(|o| o.key));
                Ok(())
            })?;

        let mut logs = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((task_name, millis)) = parse_task_log_key(&key) else {
                continue;
            };
            let mut content = String::new();
            self.storage.open(&key)?.read_to_string(&mut content)?;
            logs.push(TaskLog {
                task_name,
                started_at: Utc.timestamp_millis_opt(millis).single(),
                key,
                content,
            });
        }
        logs.sort_by(|a, b| (&a.task_name, a.started_at).cmp(&(&b.task_name, b.started_at)));
        Ok(logs)
    }
}
