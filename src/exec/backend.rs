// src/exec/backend.rs

//! Agent pool abstraction.
//!
//! The engine hands Ready tasks to an `AgentPool` and never waits for them:
//! results come back later as [`AgentEvent`]s on the runtime channel.
//!
//! - `LocalAgentPool` is the implementation used by `sessionflow sched`. It
//!   forwards requests to the executor loop in [`super::executor_loop`],
//!   which runs each command as a local process.
//! - Tests provide their own `AgentPool` that records dispatches and lets
//!   the test decide when and how tasks complete.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::engine::RuntimeEvent;
use crate::errors::{FlowError, Result};
use crate::executor::TaskOutcome;
use crate::storage::ObjectStorage;
use crate::types::{AttemptId, Params, TaskId};

use super::executor_loop::{spawn_executor, PoolCommand};

/// Everything an agent needs to run one task.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub task_id: TaskId,
    pub attempt_id: AttemptId,
    /// Qualified task name.
    pub task_name: String,
    pub command: String,
    /// Attempt params, exported outputs, task params and session fields.
    pub params: Params,
}

/// Inbound notifications from agents.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Completed { task_id: TaskId, outcome: TaskOutcome },
    /// The agent stopped the task in response to [`AgentPool::cancel`].
    CancelAcknowledged { task_id: TaskId },
    /// The task is still alive.
    Heartbeat { task_id: TaskId },
}

impl AgentEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            AgentEvent::Completed { task_id, .. }
            | AgentEvent::CancelAcknowledged { task_id }
            | AgentEvent::Heartbeat { task_id } => *task_id,
        }
    }
}

/// Trait abstracting where tasks run.
///
/// Both calls must return quickly: they are made while the attempt's state
/// is locked. An `Err` means the request was not accepted; the engine keeps
/// the task Ready and offers it again on the next tick.
pub trait AgentPool: Send + Sync + Debug {
    fn dispatch(&self, request: DispatchRequest) -> Result<()>;

    /// Best-effort stop of a dispatched task. The agent answers with
    /// `CancelAcknowledged` (or a normal completion if it won the race).
    fn cancel(&self, task_id: TaskId) -> Result<()>;
}

/// Knobs of the local process pool.
#[derive(Debug, Clone)]
pub struct LocalAgentSettings {
    /// How often a running task reports a heartbeat.
    pub heartbeat_interval: Duration,
    /// Capacity of the request queue in front of the executor loop.
    pub queue_capacity: usize,
}

impl Default for LocalAgentSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

/// Agent pool running commands as local processes.
///
/// Must be created inside a Tokio runtime: it spawns the executor loop
/// immediately.
#[derive(Debug, Clone)]
pub struct LocalAgentPool {
    tx: mpsc::Sender<PoolCommand>,
}

impl LocalAgentPool {
    pub fn spawn(
        runtime_tx: mpsc::Sender<RuntimeEvent>,
        storage: Arc<dyn ObjectStorage>,
        settings: LocalAgentSettings,
    ) -> Self {
        let tx = spawn_executor(runtime_tx, storage, settings);
        Self { tx }
    }

    fn send(&self, command: PoolCommand) -> Result<()> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => FlowError::infrastructure("agent pool queue is full"),
            TrySendError::Closed(_) => FlowError::infrastructure("agent pool has stopped"),
        })
    }
}

impl AgentPool for LocalAgentPool {
    fn dispatch(&self, request: DispatchRequest) -> Result<()> {
        self.send(PoolCommand::Run(request))
    }

    fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.send(PoolCommand::Cancel(task_id))
    }
}

/// Pool of a process that only reads state (CLI queries): every request is
/// refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedAgentPool;

impl AgentPool for DetachedAgentPool {
    fn dispatch(&self, request: DispatchRequest) -> Result<()> {
        Err(FlowError::infrastructure(format!(
            "no agents in this process (task '{}')",
            request.task_name
        )))
    }

    fn cancel(&self, task_id: TaskId) -> Result<()> {
        Err(FlowError::infrastructure(format!(
            "no agents in this process (task {task_id})"
        )))
    }
}
