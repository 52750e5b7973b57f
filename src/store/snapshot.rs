// src/store/snapshot.rs

//! File-backed store: an in-memory store whose full contents are rewritten
//! to `<dir>/state.json` after every mutation.
//!
//! Each write costs time proportional to the whole history (finished
//! attempts included), which suits single-node deployments of modest size.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::memory::{MemoryStore, Tables};
use super::model::{AttemptRecord, RecordFilter, ScheduleRecord, SessionRecord, TaskRecord};
use super::Store;
use crate::errors::{FlowError, Result};
use crate::fs::FileSystem;
use crate::types::{AttemptId, ScheduleId, SessionId, TaskId, WorkflowRef};

pub const SNAPSHOT_FILE: &str = "state.json";

#[derive(Debug)]
pub struct SnapshotStore {
    inner: MemoryStore,
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    /// Serializes mutate-then-persist so snapshots are written in order.
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Open the snapshot in `dir`, starting empty if none exists yet.
    pub fn open(fs: Arc<dyn FileSystem>, dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(SNAPSHOT_FILE);
        let tables = if fs.is_file(&path) {
            let contents = fs.read_to_string(&path)?;
            let tables: Tables = serde_json::from_str(&contents)?;
            info!(path = %path.display(), "loaded state snapshot");
            tables
        } else {
            debug!(path = %path.display(), "no state snapshot yet; starting empty");
            Tables::default()
        };

        Ok(Self {
            inner: MemoryStore::from_tables(tables),
            fs,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` and write the snapshot. If the write fails the in-memory
    /// state is rolled back, so memory never runs ahead of the file.
    fn mutate<T>(&self, f: impl FnOnce(&MemoryStore) -> Result<T>) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| FlowError::infrastructure("snapshot lock poisoned"))?;
        let before = self.inner.tables()?;
        let out = f(&self.inner)?;
        if let Err(e) = self.persist() {
            warn!(path = %self.path.display(), error = %e, "snapshot write failed; change rolled back");
            self.inner.restore(before)?;
            return Err(e);
        }
        Ok(out)
    }

    fn persist(&self) -> Result<()> {
        let tables = self.inner.tables()?;
        let bytes = serde_json::to_vec(&tables)?;
        self.fs.write(&self.path, &bytes).map_err(|e| {
            FlowError::infrastructure(format!(
                "writing snapshot {}: {e:#}",
                self.path.display()
            ))
        })
    }
}

impl Store for SnapshotStore {
    fn insert_schedule(&self, schedule: ScheduleRecord) -> Result<ScheduleRecord> {
        self.mutate(|s| s.insert_schedule(schedule))
    }

    fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<()> {
        self.mutate(|s| s.update_schedule(schedule))
    }

    fn delete_schedule(&self, id: ScheduleId) -> Result<()> {
        self.mutate(|s| s.delete_schedule(id))
    }

    fn schedule(&self, id: ScheduleId) -> Result<Option<ScheduleRecord>> {
        self.inner.schedule(id)
    }

    fn schedules(&self) -> Result<Vec<ScheduleRecord>> {
        self.inner.schedules()
    }

    fn insert_session_if_absent(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> Result<(SessionRecord, bool)> {
        self.mutate(|s| s.insert_session_if_absent(workflow, session_time))
    }

    fn session(&self, id: SessionId) -> Result<Option<SessionRecord>> {
        self.inner.session(id)
    }

    fn find_session(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>> {
        self.inner.find_session(workflow, session_time)
    }

    fn sessions(&self, filter: &RecordFilter) -> Result<Vec<SessionRecord>> {
        self.inner.sessions(filter)
    }

    fn insert_attempt_with_tasks(
        &self,
        attempt: AttemptRecord,
        tasks: Vec<TaskRecord>,
    ) -> Result<(AttemptRecord, Vec<TaskRecord>)> {
        self.mutate(|s| s.insert_attempt_with_tasks(attempt, tasks))
    }

    fn update_attempt(&self, attempt: &AttemptRecord) -> Result<()> {
        self.mutate(|s| s.update_attempt(attempt))
    }

    fn attempt(&self, id: AttemptId) -> Result<Option<AttemptRecord>> {
        self.inner.attempt(id)
    }

    fn attempts_of_session(&self, session_id: SessionId) -> Result<Vec<AttemptRecord>> {
        self.inner.attempts_of_session(session_id)
    }

    fn attempts(&self, filter: &RecordFilter) -> Result<Vec<AttemptRecord>> {
        self.inner.attempts(filter)
    }

    fn update_tasks(&self, tasks: &[TaskRecord]) -> Result<()> {
        self.mutate(|s| s.update_tasks(tasks))
    }

    fn task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        self.inner.task(id)
    }

    fn tasks_of_attempt(&self, attempt_id: AttemptId) -> Result<Vec<TaskRecord>> {
        self.inner.tasks_of_attempt(attempt_id)
    }
}
