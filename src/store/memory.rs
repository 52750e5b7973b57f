// src/store/memory.rs

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{AttemptRecord, RecordFilter, ScheduleRecord, SessionRecord, TaskRecord};
use super::Store;
use crate::errors::{FlowError, Result};
use crate::types::{AttemptId, ScheduleId, SessionId, TaskId, WorkflowRef};

/// Full store contents. Serialized as-is by the snapshot store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    next_id: u64,
    schedules: BTreeMap<ScheduleId, ScheduleRecord>,
    sessions: BTreeMap<SessionId, SessionRecord>,
    attempts: BTreeMap<AttemptId, AttemptRecord>,
    tasks: BTreeMap<TaskId, TaskRecord>,
}

impl Tables {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory store. Used by `sched --memory` and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Clone of the current contents.
    pub fn tables(&self) -> Result<Tables> {
        Ok(self.read()?.clone())
    }

    /// Replace the contents wholesale.
    pub fn restore(&self, tables: Tables) -> Result<()> {
        *self.write()? = tables;
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| FlowError::infrastructure("store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| FlowError::infrastructure("store lock poisoned"))
    }
}

impl Store for MemoryStore {
    fn insert_schedule(&self, mut schedule: ScheduleRecord) -> Result<ScheduleRecord> {
        let mut tables = self.write()?;
        if tables
            .schedules
            .values()
            .any(|s| s.workflow == schedule.workflow)
        {
            return Err(FlowError::conflict(format!(
                "workflow {} already has a schedule",
                schedule.workflow
            )));
        }
        schedule.id = ScheduleId(tables.alloc_id());
        tables.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<()> {
        let mut tables = self.write()?;
        match tables.schedules.get_mut(&schedule.id) {
            Some(row) => {
                *row = schedule.clone();
                Ok(())
            }
            None => Err(FlowError::not_found(format!("schedule {}", schedule.id))),
        }
    }

    fn delete_schedule(&self, id: ScheduleId) -> Result<()> {
        let mut tables = self.write()?;
        tables
            .schedules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| FlowError::not_found(format!("schedule {id}")))
    }

    fn schedule(&self, id: ScheduleId) -> Result<Option<ScheduleRecord>> {
        Ok(self.read()?.schedules.get(&id).cloned())
    }

    fn schedules(&self) -> Result<Vec<ScheduleRecord>> {
        Ok(self.read()?.schedules.values().cloned().collect())
    }

    fn insert_session_if_absent(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> Result<(SessionRecord, bool)> {
        // The check and the insert share one write guard.
        let mut tables = self.write()?;
        if let Some(existing) = tables
            .sessions
            .values()
            .find(|s| s.workflow == *workflow && s.session_time == session_time)
        {
            return Ok((existing.clone(), false));
        }

        let session = SessionRecord {
            id: SessionId(tables.alloc_id()),
            uuid: Uuid::new_v4(),
            workflow: workflow.clone(),
            session_time,
        };
        tables.sessions.insert(session.id, session.clone());
        Ok((session, true))
    }

    fn session(&self, id: SessionId) -> Result<Option<SessionRecord>> {
        Ok(self.read()?.sessions.get(&id).cloned())
    }

    fn find_session(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>> {
        Ok(self
            .read()?
            .sessions
            .values()
            .find(|s| s.workflow == *workflow && s.session_time == session_time)
            .cloned())
    }

    fn sessions(&self, filter: &RecordFilter) -> Result<Vec<SessionRecord>> {
        Ok(self
            .read()?
            .sessions
            .values()
            .filter(|s| filter.matches(&s.workflow))
            .cloned()
            .collect())
    }

    fn insert_attempt_with_tasks(
        &self,
        mut attempt: AttemptRecord,
        tasks: Vec<TaskRecord>,
    ) -> Result<(AttemptRecord, Vec<TaskRecord>)> {
        let mut tables = self.write()?;
        if !tables.sessions.contains_key(&attempt.session_id) {
            return Err(FlowError::not_found(format!(
                "session {}",
                attempt.session_id
            )));
        }
        if tasks.is_empty() {
            return Err(FlowError::validation(format!(
                "attempt of session {} has no tasks",
                attempt.session_id
            )));
        }

        attempt.id = AttemptId(tables.alloc_id());
        let mut rows = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.id = TaskId(tables.alloc_id());
            task.attempt_id = attempt.id;
            rows.push(task);
        }
        tables.attempts.insert(attempt.id, attempt.clone());
        for task in &rows {
            tables.tasks.insert(task.id, task.clone());
        }
        Ok((attempt, rows))
    }

    fn update_attempt(&self, attempt: &AttemptRecord) -> Result<()> {
        let mut tables = self.write()?;
        match tables.attempts.get_mut(&attempt.id) {
            Some(row) => {
                *row = attempt.clone();
                Ok(())
            }
            None => Err(FlowError::not_found(format!("attempt {}", attempt.id))),
        }
    }

    fn attempt(&self, id: AttemptId) -> Result<Option<AttemptRecord>> {
        Ok(self.read()?.attempts.get(&id).cloned())
    }

    fn attempts_of_session(&self, session_id: SessionId) -> Result<Vec<AttemptRecord>> {
        Ok(self
            .read()?
            .attempts
            .values()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect())
    }

    fn attempts(&self, filter: &RecordFilter) -> Result<Vec<AttemptRecord>> {
        Ok(self
            .read()?
            .attempts
            .values()
            .filter(|a| filter.matches(&a.workflow))
            .cloned()
            .collect())
    }

    fn update_tasks(&self, tasks: &[TaskRecord]) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(missing) = tasks.iter().find(|t| !tables.tasks.contains_key(&t.id)) {
            return Err(FlowError::not_found(format!("task {}", missing.id)));
        }
        for task in tasks {
            tables.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    fn task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    fn tasks_of_attempt(&self, attempt_id: AttemptId) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self
            .read()?
            .tasks
            .values()
            .filter(|t| t.attempt_id == attempt_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.index);
        Ok(tasks)
    }
}
