// tests/store_failures.rs

mod common;
use crate::common::{at_hour, chain, epoch, init_tracing, TestEngineBuilder};

use std::error::Error;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use sessionflow::clock::Clock;
use sessionflow::engine::RetryTarget;
use sessionflow::errors::{FlowError, Result as FlowResult};
use sessionflow::exec::AgentEvent;
use sessionflow::executor::TaskOutcome;
use sessionflow::fs::{FileSystem, MockFileSystem};
use sessionflow::store::{
    AttemptRecord, MemoryStore, RecordFilter, ScheduleRecord, SessionRecord, SnapshotStore, Store,
    TaskRecord,
};
use sessionflow::types::{
    AttemptId, AttemptState, Params, RetryMode, ScheduleId, SessionId, TaskId, TaskState,
    WorkflowRef,
};

type TestResult = Result<(), Box<dyn Error>>;

/// Memory store whose attempt inserts and task updates can be made to fail.
#[derive(Debug, Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
}

impl FlakyStore {
    fn unreachable() -> FlowError {
        FlowError::infrastructure("store unreachable")
    }
}

impl Store for FlakyStore {
    fn insert_schedule(&self, schedule: ScheduleRecord) -> FlowResult<ScheduleRecord> {
        self.inner.insert_schedule(schedule)
    }
    fn update_schedule(&self, schedule: &ScheduleRecord) -> FlowResult<()> {
        self.inner.update_schedule(schedule)
    }
    fn delete_schedule(&self, id: ScheduleId) -> FlowResult<()> {
        self.inner.delete_schedule(id)
    }
    fn schedule(&self, id: ScheduleId) -> FlowResult<Option<ScheduleRecord>> {
        self.inner.schedule(id)
    }
    fn schedules(&self) -> FlowResult<Vec<ScheduleRecord>> {
        self.inner.schedules()
    }
    fn insert_session_if_absent(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> FlowResult<(SessionRecord, bool)> {
        self.inner.insert_session_if_absent(workflow, session_time)
    }
    fn session(&self, id: SessionId) -> FlowResult<Option<SessionRecord>> {
        self.inner.session(id)
    }
    fn find_session(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> FlowResult<Option<SessionRecord>> {
        self.inner.find_session(workflow, session_time)
    }
    fn sessions(&self, filter: &RecordFilter) -> FlowResult<Vec<SessionRecord>> {
        self.inner.sessions(filter)
    }
    fn insert_attempt_with_tasks(
        &self,
        attempt: AttemptRecord,
        tasks: Vec<TaskRecord>,
    ) -> FlowResult<(AttemptRecord, Vec<TaskRecord>)> {
        if self.fail_inserts.swap(false, Ordering::SeqCst) {
            return Err(Self::unreachable());
        }
        self.inner.insert_attempt_with_tasks(attempt, tasks)
    }
    fn update_attempt(&self, attempt: &AttemptRecord) -> FlowResult<()> {
        self.inner.update_attempt(attempt)
    }
    fn attempt(&self, id: AttemptId) -> FlowResult<Option<AttemptRecord>> {
        self.inner.attempt(id)
    }
    fn attempts_of_session(&self, session_id: SessionId) -> FlowResult<Vec<AttemptRecord>> {
        self.inner.attempts_of_session(session_id)
    }
    fn attempts(&self, filter: &RecordFilter) -> FlowResult<Vec<AttemptRecord>> {
        self.inner.attempts(filter)
    }
    fn update_tasks(&self, tasks: &[TaskRecord]) -> FlowResult<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::unreachable());
        }
        self.inner.update_tasks(tasks)
    }
    fn task(&self, id: TaskId) -> FlowResult<Option<TaskRecord>> {
        self.inner.task(id)
    }
    fn tasks_of_attempt(&self, attempt_id: AttemptId) -> FlowResult<Vec<TaskRecord>> {
        self.inner.tasks_of_attempt(attempt_id)
    }
}

/// Mock filesystem whose writes fail while `fail` is set.
#[derive(Debug, Clone, Default)]
struct BrittleFs {
    inner: MockFileSystem,
    fail: Arc<AtomicBool>,
}

impl FileSystem for BrittleFs {
    fn read_to_string(&self, path: &Path) -> anyhow::Result<String> {
        self.inner.read_to_string(path)
    }
    fn open_read(&self, path: &Path) -> anyhow::Result<Box<dyn Read + Send>> {
        self.inner.open_read(path)
    }
    fn write(&self, path: &Path, contents: &[u8]) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("disk full writing {:?}", path);
        }
        self.inner.write(path, contents)
    }
    fn remove_file(&self, path: &Path) -> anyhow::Result<()> {
        self.inner.remove_file(path)
    }
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
    fn is_file(&self, path: &Path) -> bool {
        self.inner.is_file(path)
    }
    fn is_dir(&self, path: &Path) -> bool {
        self.inner.is_dir(path)
    }
    fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<PathBuf>> {
        self.inner.read_dir(path)
    }
}

#[test]
fn failed_attempt_insert_leaves_the_session_startable() -> TestResult {
    init_tracing();
    let store = Arc::new(FlakyStore::default());
    let t = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .with_store(store.clone())
        .build();

    store.fail_inserts.store(true, Ordering::SeqCst);
    let err = t.start("wf", epoch()).unwrap_err();
    assert!(matches!(err, FlowError::Infrastructure(_)), "got {err:?}");
    assert!(t.engine.attempts(&RecordFilter::default())?.is_empty());
    assert_eq!(t.engine.live_attempts(), 0);

    // With the store healthy again the same session starts normally.
    let attempt = t.start("wf", epoch())?;
    assert_eq!(attempt.state, AttemptState::Running);
    assert_eq!(t.agents.dispatched_names(), vec!["+wf+a"]);
    assert_eq!(t.engine.recover()?, 0);
    Ok(())
}

#[test]
fn unloadable_attempt_is_closed_and_recovery_continues() -> TestResult {
    init_tracing();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let before = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .with_store(Arc::clone(&store))
        .build();
    let healthy = before.start("wf", epoch())?;
    let broken = before.start("wf", at_hour(1))?;

    let mut rows = store.tasks_of_attempt(broken.id)?;
    rows[1].deps = vec![99];
    store.update_tasks(&rows)?;

    // Restart on the same store.
    let after = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .with_store(Arc::clone(&store))
        .build();
    assert_eq!(after.engine.recover()?, 1);

    let closed = after.attempt(broken.id);
    assert!(closed.done);
    assert_eq!(closed.state, AttemptState::Error);
    assert!(!after.attempt(healthy.id).done);
    assert_eq!(after.agents.dispatched_names(), vec!["+wf+a"]);

    // The broken attempt's session is no longer blocked.
    let again = after
        .engine
        .retry(RetryTarget::Attempt(broken.id), "again", RetryMode::All, None)?;
    assert_eq!(again.session_id, broken.session_id);
    assert_eq!(again.state, AttemptState::Running);
    Ok(())
}

#[test]
fn failed_task_write_is_retried_on_the_next_tick() -> TestResult {
    init_tracing();
    let store = Arc::new(FlakyStore::default());
    let t = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .with_store(store.clone())
        .build();
    let attempt = t.start("wf", epoch())?;
    let request = t.agents.last_dispatch_of("+wf+a").expect("dispatched");

    store.fail_updates.store(true, Ordering::SeqCst);
    let err = t
        .engine
        .handle_agent_event(AgentEvent::Completed {
            task_id: request.task_id,
            outcome: TaskOutcome::Success(Params::new()),
        })
        .unwrap_err();
    assert!(matches!(err, FlowError::Infrastructure(_)), "got {err:?}");
    assert_eq!(t.task(attempt.id, "+wf+a").state, TaskState::Running);

    store.fail_updates.store(false, Ordering::SeqCst);
    t.engine.tick(t.clock.now())?;
    assert_eq!(t.task(attempt.id, "+wf+a").state, TaskState::Success);
    assert_eq!(t.task(attempt.id, "+wf+b").state, TaskState::Running);
    Ok(())
}

#[test]
fn snapshot_write_failure_rolls_back_the_change() -> TestResult {
    init_tracing();
    let fs = BrittleFs::default();
    let store: Arc<dyn Store> = Arc::new(SnapshotStore::open(Arc::new(fs.clone()), "db")?);
    let t = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a"]))
        .with_store(Arc::clone(&store))
        .build();

    fs.fail.store(true, Ordering::SeqCst);
    let err = t.start("wf", epoch()).unwrap_err();
    assert!(matches!(err, FlowError::Infrastructure(_)), "got {err:?}");
    assert!(store.sessions(&RecordFilter::default())?.is_empty());
    assert!(store.attempts(&RecordFilter::default())?.is_empty());

    fs.fail.store(false, Ordering::SeqCst);
    let attempt = t.start("wf", epoch())?;

    let reopened = SnapshotStore::open(Arc::new(fs.clone()), "db")?;
    let stored = reopened.attempts(&RecordFilter::default())?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, attempt.id);
    assert_eq!(reopened.tasks_of_attempt(attempt.id)?.len(), 2);
    Ok(())
}
