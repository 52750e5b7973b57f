// src/store/model.rs

//! Persisted records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timeline::ScheduleSpec;
use crate::types::{
    AttemptId, AttemptState, Params, RetryPolicy, ScheduleId, SessionId, TaskId, TaskState,
    WorkflowRef,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: ScheduleId,
    pub workflow: WorkflowRef,
    pub spec: ScheduleSpec,
    /// Instant the next tick is due.
    pub next_run_time: DateTime<Utc>,
    /// Logical session time the next tick represents.
    pub next_schedule_time: DateTime<Utc>,
    /// Session time of the most recent tick (used by `skip_on_overtime`).
    #[serde(default)]
    pub last_session_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub uuid: Uuid,
    pub workflow: WorkflowRef,
    pub session_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: AttemptId,
    pub session_id: SessionId,
    pub workflow: WorkflowRef,
    pub session_time: DateTime<Utc>,
    /// `None` for the default (first) attempt of a session.
    pub retry_attempt_name: Option<String>,
    pub params: Params,
    /// Output parameters merged from successful tasks.
    #[serde(default)]
    pub exported: Params,
    pub state: AttemptState,
    pub done: bool,
    #[serde(default)]
    pub kill_requested: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub attempt_id: AttemptId,
    /// Position in the attempt's task arena. Parents precede their children.
    pub index: usize,
    /// Qualified name, e.g. `+daily+load+a`.
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Indices this task waits on (previous sibling and explicit `after`).
    pub deps: Vec<usize>,
    /// Command for leaf tasks; `None` marks a group.
    pub command: Option<String>,
    #[serde(default)]
    pub params: Params,
    pub retry: RetryPolicy,
    pub state: TaskState,
    #[serde(default)]
    pub retry_count: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub outputs: Params,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn is_group(&self) -> bool {
        self.command.is_none()
    }
}

/// Filter for session / attempt listings. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub project: Option<String>,
    pub workflow: Option<String>,
}

impl RecordFilter {
    pub fn for_workflow(workflow: &WorkflowRef) -> Self {
        Self {
            project: Some(workflow.project.clone()),
            workflow: Some(workflow.workflow.clone()),
        }
    }

    pub fn matches(&self, workflow: &WorkflowRef) -> bool {
        self.project.as_ref().is_none_or(|p| *p == workflow.project)
            && self.workflow.as_ref().is_none_or(|w| *w == workflow.workflow)
    }
}
