// src/engine/mod.rs

//! Orchestration engine.
//!
//! [`Engine`] is the synchronous core shared as `Arc<Engine>` by the tick
//! driver, operator actions and agent events. It ties together:
//! - the schedule timeline and session registry,
//! - the attempt scheduler ([`attempts`]),
//! - the retry / backfill / reschedule coordinator ([`coordinator`]),
//! - kill handling ([`kill`]) and the tick ([`tick`]),
//! - read-only queries ([`queries`]).
//!
//! Live attempts are held as `AttemptRun`s, each behind its own mutex; every
//! task mutation happens while holding it. The async/IO shell that feeds
//! ticks and agent events into the engine is [`runtime`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::dag::WorkflowDefinition;
use crate::errors::{FlowError, Result};
use crate::exec::{AgentEvent, AgentPool, DispatchRequest};
use crate::executor::{AttemptRun, ExecutorStep};
use crate::locks::LockTable;
use crate::registry::SessionRegistry;
use crate::storage::ObjectStorage;
use crate::store::{AttemptRecord, Store, TaskRecord};
use crate::timeline::ScheduleTimeline;
use crate::types::{AttemptId, AttemptState, SessionId, TaskId, WorkflowRef};

pub mod attempts;
pub mod command;
pub mod coordinator;
pub mod inbox;
pub mod kill;
pub mod project;
pub mod queries;
pub mod runtime;
pub mod tick;

pub use command::{Command, CommandOutput};
pub use coordinator::{AttemptSummary, RetryTarget};
pub use inbox::{CommandInbox, CommandResponse};
pub use project::{ProjectDefinition, WorkflowEntry};
pub use queries::{ScheduleSummary, TaskLog};
pub use runtime::{Runtime, RuntimeOptions};
pub use tick::TickReport;

/// Events flowing into the runtime from agents, timers and signals.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Agent(AgentEvent),
    /// Evaluate the timeline now instead of waiting for the next interval.
    Tick,
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

/// Engine tunables, usually taken from the `[server]` config section.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// A Running task silent for this long is treated as failed.
    pub heartbeat_timeout: Option<Duration>,
    /// Upper bound of sessions one schedule may create in a single tick.
    pub max_catchup_ticks: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Some(Duration::from_secs(300)),
            max_catchup_ticks: 100,
        }
    }
}

type LiveRun = Arc<Mutex<AttemptRun>>;

pub struct Engine {
    store: Arc<dyn Store>,
    agents: Arc<dyn AgentPool>,
    storage: Arc<dyn ObjectStorage>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    timeline: ScheduleTimeline,
    registry: SessionRegistry,
    workflows: RwLock<HashMap<WorkflowRef, WorkflowDefinition>>,
    session_locks: LockTable<SessionId>,
    runs: RwLock<HashMap<AttemptId, LiveRun>>,
    task_owners: RwLock<HashMap<TaskId, AttemptId>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        agents: Arc<dyn AgentPool>,
        storage: Arc<dyn ObjectStorage>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            timeline: ScheduleTimeline::new(Arc::clone(&store)),
            registry: SessionRegistry::new(Arc::clone(&store)),
            store,
            agents,
            storage,
            clock,
            settings,
            workflows: RwLock::new(HashMap::new()),
            session_locks: LockTable::new(),
            runs: RwLock::new(HashMap::new()),
            task_owners: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn timeline(&self) -> &ScheduleTimeline {
        &self.timeline
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of attempts currently held live.
    pub fn live_attempts(&self) -> usize {
        self.runs.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Rebuild live runs for every attempt that is not done.
    ///
    /// Tasks persisted as Running are redispatched (their agents did not
    /// survive the restart) without consuming retry budget; attempts with a
    /// pending kill cancel them instead. An attempt whose task rows cannot
    /// be loaded is closed as Error so its session does not stay blocked.
    pub fn recover(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut recovered = 0;
        for attempt in self.store.attempts(&Default::default())? {
            if attempt.done || self.live_run(attempt.id)?.is_some() {
                continue;
            }
            let attempt_id = attempt.id;
            let loaded = self
                .store
                .tasks_of_attempt(attempt_id)
                .and_then(|tasks| AttemptRun::new(attempt.clone(), tasks));
            let run = match loaded {
                Ok(run) => run,
                Err(e) => {
                    error!(attempt_id = %attempt_id, error = %e, "attempt cannot be recovered; closing it");
                    self.close_unloadable(attempt, now);
                    continue;
                }
            };
            let live = self.register_run(run)?;
            let mut run = lock_run(&live)?;
            let step = run.recover(now);
            if let Err(e) = self.apply_step(&mut run, step) {
                warn!(attempt_id = %attempt_id, error = %e, "recovered attempt not persisted; retried next tick");
            }
            recovered += 1;
            info!(attempt_id = %attempt_id, "attempt recovered");
        }
        if recovered > 0 {
            info!(recovered, "recovered unfinished attempts");
        }
        Ok(recovered)
    }

    fn close_unloadable(&self, mut attempt: AttemptRecord, now: DateTime<Utc>) {
        let attempt_id = attempt.id;
        attempt.state = AttemptState::Error;
        attempt.done = true;
        attempt.finished_at = Some(now);
        if let Err(e) = self.store.update_attempt(&attempt) {
            error!(attempt_id = %attempt_id, error = %e, "failed to close unrecoverable attempt");
        }
    }

    /// Route an agent event to the attempt owning the task.
    pub fn handle_agent_event(&self, event: AgentEvent) -> Result<()> {
        let task_id = event.task_id();
        let Some(live) = self.run_of_task(task_id)? else {
            debug!(task_id = %task_id, ?event, "event for a task with no live attempt; ignoring");
            return Ok(());
        };

        let now = self.clock.now();
        let mut run = lock_run(&live)?;
        let Some(index) = run.index_of(task_id) else {
            return Ok(());
        };
        let step = match event {
            AgentEvent::Completed { outcome, .. } => run.complete(index, outcome, now),
            AgentEvent::CancelAcknowledged { .. } => run.cancel_acknowledged(index, now),
            AgentEvent::Heartbeat { .. } => {
                run.heartbeat(index, now);
                ExecutorStep::default()
            }
        };
        self.apply_step(&mut run, step)
    }

    pub(crate) fn heartbeat_timeout(&self) -> Option<TimeDelta> {
        self.settings
            .heartbeat_timeout
            .and_then(|d| TimeDelta::from_std(d).ok())
    }

    pub(crate) fn workflow(&self, workflow: &WorkflowRef) -> Result<Option<WorkflowDefinition>> {
        let workflows = self
            .workflows
            .read()
            .map_err(|_| FlowError::infrastructure("workflow table poisoned"))?;
        Ok(workflows.get(workflow).cloned())
    }

    pub(crate) fn live_run(&self, attempt_id: AttemptId) -> Result<Option<LiveRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| FlowError::infrastructure("run table poisoned"))?;
        Ok(runs.get(&attempt_id).cloned())
    }

    pub(crate) fn live_runs(&self) -> Result<Vec<LiveRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| FlowError::infrastructure("run table poisoned"))?;
        let mut ids: Vec<&AttemptId> = runs.keys().collect();
        ids.sort();
        Ok(ids.into_iter().filter_map(|id| runs.get(id).cloned()).collect())
    }

    fn run_of_task(&self, task_id: TaskId) -> Result<Option<LiveRun>> {
        let attempt_id = {
            let owners = self
                .task_owners
                .read()
                .map_err(|_| FlowError::infrastructure("task index poisoned"))?;
            owners.get(&task_id).copied()
        };
        match attempt_id {
            Some(id) => self.live_run(id),
            None => Ok(None),
        }
    }

    pub(crate) fn register_run(&self, run: AttemptRun) -> Result<LiveRun> {
        let attempt_id = run.attempt().id;
        {
            let mut owners = self
                .task_owners
                .write()
                .map_err(|_| FlowError::infrastructure("task index poisoned"))?;
            for task in run.tasks() {
                owners.insert(task.id, attempt_id);
            }
        }
        let live = Arc::new(Mutex::new(run));
        let mut runs = self
            .runs
            .write()
            .map_err(|_| FlowError::infrastructure("run table poisoned"))?;
        runs.insert(attempt_id, Arc::clone(&live));
        Ok(live)
    }

    fn unregister_run(&self, run: &AttemptRun) -> Result<()> {
        let mut owners = self
            .task_owners
            .write()
            .map_err(|_| FlowError::infrastructure("task index poisoned"))?;
        for task in run.tasks() {
            owners.remove(&task.id);
        }
        drop(owners);
        let mut runs = self
            .runs
            .write()
            .map_err(|_| FlowError::infrastructure("run table poisoned"))?;
        runs.remove(&run.attempt().id);
        Ok(())
    }

    /// Carry out a step while the run is locked: cancel, dispatch, persist.
    ///
    /// A failed dispatch leaves the task Ready; the next tick offers it
    /// again.
    pub(crate) fn apply_step(&self, run: &mut AttemptRun, step: ExecutorStep) -> Result<()> {
        let now = self.clock.now();
        let attempt_id = run.attempt().id;

        for index in step.cancel_requests.iter().copied() {
            let Some(task) = run.task(index) else {
                continue;
            };
            if let Err(e) = self.agents.cancel(task.id) {
                warn!(attempt_id = %attempt_id, task = %task.name, error = %e, "cancel request failed");
            }
        }

        if !step.ready.is_empty() {
            let session = self.store.session(run.attempt().session_id)?;
            for index in step.ready.iter().copied() {
                let Some(request) = dispatch_request(run, index, session.as_ref()) else {
                    continue;
                };
                let task_name = request.task_name.clone();
                match self.agents.dispatch(request) {
                    Ok(()) => {
                        run.mark_dispatched(index, now);
                        debug!(attempt_id = %attempt_id, task = %task_name, "task dispatched");
                    }
                    Err(e) => warn!(
                        attempt_id = %attempt_id,
                        task = %task_name,
                        error = %e,
                        "dispatch failed; task stays ready"
                    ),
                }
            }
        }

        let (tasks, attempt) = run.take_dirty();
        let written = self.write_rows(&tasks, attempt.as_ref());
        if written.is_err() {
            // Keep the rows pending; the next step for this run writes them.
            run.keep_dirty(&tasks, attempt.is_some());
        }
        written?;

        if run.is_done() {
            self.unregister_run(run)?;
        }
        Ok(())
    }
}

impl Engine {
    fn write_rows(&self, tasks: &[TaskRecord], attempt: Option<&AttemptRecord>) -> Result<()> {
        if !tasks.is_empty() {
            self.store.update_tasks(tasks)?;
        }
        if let Some(attempt) = attempt {
            self.store.update_attempt(attempt)?;
        }
        Ok(())
    }
}

pub(crate) fn lock_run(live: &LiveRun) -> Result<std::sync::MutexGuard<'_, AttemptRun>> {
    live.lock()
        .map_err(|_| FlowError::infrastructure("attempt lock poisoned"))
}

/// Build the agent request for a Ready command task.
fn dispatch_request(
    run: &AttemptRun,
    index: usize,
    session: Option<&crate::store::SessionRecord>,
) -> Option<DispatchRequest> {
    let task = run.task(index)?;
    if task.state != crate::types::TaskState::Ready {
        return None;
    }
    let command = task.command.clone()?;
    let attempt = run.attempt();

    let mut params = run.dispatch_params(index);
    params.insert(
        "session_time".into(),
        attempt.session_time.to_rfc3339().into(),
    );
    params.insert("session_id".into(), attempt.session_id.0.into());
    params.insert("attempt_id".into(), attempt.id.0.into());
    params.insert("task_name".into(), task.name.clone().into());
    if let Some(session) = session {
        params.insert("session_uuid".into(), session.uuid.to_string().into());
    }

    Some(DispatchRequest {
        task_id: task.id,
        attempt_id: attempt.id,
        task_name: task.name.clone(),
        command,
        params,
    })
}
