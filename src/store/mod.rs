// src/store/mod.rs

//! Durable store contract for schedules, sessions, attempts and tasks.
//!
//! - [`model`] holds the persisted record types.
//! - [`memory`] is an in-process implementation (also the base of the
//!   snapshot store).
//! - [`snapshot`] persists the full state as a JSON file after every write,
//!   which is what `sched --database DIR` uses.
//!
//! Implementations must make `insert_session_if_absent` atomic: concurrent
//! callers for the same `(workflow, session_time)` observe one session.

pub mod memory;
pub mod model;
pub mod snapshot;

use std::fmt::Debug;

use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::types::{AttemptId, ScheduleId, SessionId, TaskId, WorkflowRef};

pub use memory::MemoryStore;
pub use model::{AttemptRecord, RecordFilter, ScheduleRecord, SessionRecord, TaskRecord};
pub use snapshot::SnapshotStore;

pub trait Store: Send + Sync + Debug {
    /// Insert a schedule; the `id` field of the argument is ignored and a
    /// fresh one assigned.
    fn insert_schedule(&self, schedule: ScheduleRecord) -> Result<ScheduleRecord>;
    fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<()>;
    fn delete_schedule(&self, id: ScheduleId) -> Result<()>;
    fn schedule(&self, id: ScheduleId) -> Result<Option<ScheduleRecord>>;
    fn schedules(&self) -> Result<Vec<ScheduleRecord>>;

    /// Atomic compare-and-create keyed on `(workflow, session_time)`.
    ///
    /// Returns the session and whether this call created it.
    fn insert_session_if_absent(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> Result<(SessionRecord, bool)>;
    fn session(&self, id: SessionId) -> Result<Option<SessionRecord>>;
    fn find_session(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>>;
    fn sessions(&self, filter: &RecordFilter) -> Result<Vec<SessionRecord>>;

    /// Insert an attempt together with its task rows, all or nothing.
    ///
    /// `id` fields are ignored and fresh ones assigned; every task's
    /// `attempt_id` is set to the new attempt.
    fn insert_attempt_with_tasks(
        &self,
        attempt: AttemptRecord,
        tasks: Vec<TaskRecord>,
    ) -> Result<(AttemptRecord, Vec<TaskRecord>)>;
    fn update_attempt(&self, attempt: &AttemptRecord) -> Result<()>;
    fn attempt(&self, id: AttemptId) -> Result<Option<AttemptRecord>>;
    /// Attempts of one session, oldest first.
    fn attempts_of_session(&self, session_id: SessionId) -> Result<Vec<AttemptRecord>>;
    fn attempts(&self, filter: &RecordFilter) -> Result<Vec<AttemptRecord>>;

    fn update_tasks(&self, tasks: &[TaskRecord]) -> Result<()>;
    fn task(&self, id: TaskId) -> Result<Option<TaskRecord>>;
    /// Task rows of one attempt ordered by arena index.
    fn tasks_of_attempt(&self, attempt_id: AttemptId) -> Result<Vec<TaskRecord>>;
}
