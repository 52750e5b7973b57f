// src/exec/executor_loop.rs

//! Main executor loop that manages running task processes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::engine::RuntimeEvent;
use crate::exec::backend::{DispatchRequest, LocalAgentSettings};
use crate::exec::task_runner::{run_task, CancelMode};
use crate::storage::ObjectStorage;
use crate::types::TaskId;

/// Requests accepted by the executor loop.
#[derive(Debug)]
pub enum PoolCommand {
    Run(DispatchRequest),
    Cancel(TaskId),
}

/// Internal handle for a currently-running task process.
///
/// - `cancel` asks the runner to kill the process; the mode decides whether
///   the engine is told about it.
/// - `handle` is the Tokio task that is actually running the command.
struct ActiveTask {
    cancel: Option<oneshot::Sender<CancelMode>>,
    handle: tokio::task::JoinHandle<()>,
}

/// Spawn the background executor loop.
///
/// Per task id there is never more than one process: dispatching a task id
/// that is still running (a redispatch after a heartbeat timeout) kills the
/// previous process without reporting it.
pub fn spawn_executor(
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    storage: Arc<dyn ObjectStorage>,
    settings: LocalAgentSettings,
) -> mpsc::Sender<PoolCommand> {
    let (tx, mut rx) = mpsc::channel::<PoolCommand>(settings.queue_capacity.max(1));

    tokio::spawn(async move {
        info!("executor loop started");

        let mut active: HashMap<TaskId, ActiveTask> = HashMap::new();

        while let Some(command) = rx.recv().await {
            active.retain(|_, task| !task.handle.is_finished());
            match command {
                PoolCommand::Run(request) => {
                    start_task(request, &mut active, &runtime_tx, &storage, &settings);
                }
                PoolCommand::Cancel(task_id) => {
                    cancel_task(task_id, &mut active, CancelMode::Acknowledge);
                }
            }
        }

        info!("executor loop finished (channel closed)");
    });

    tx
}

fn start_task(
    request: DispatchRequest,
    active: &mut HashMap<TaskId, ActiveTask>,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
    storage: &Arc<dyn ObjectStorage>,
    settings: &LocalAgentSettings,
) {
    let task_id = request.task_id;
    if active.contains_key(&task_id) {
        info!(
            task_id = %task_id,
            task = %request.task_name,
            "task redispatched; replacing previous process instance"
        );
        cancel_task(task_id, active, CancelMode::Silent);
    }

    let (cancel_tx, cancel_rx) = oneshot::channel::<CancelMode>();
    let rt_tx = runtime_tx.clone();
    let storage = Arc::clone(storage);
    let heartbeat_interval = settings.heartbeat_interval;
    let spawn_name = request.task_name.clone();

    let handle = tokio::spawn(async move {
        run_task(request, rt_tx, storage, cancel_rx, heartbeat_interval).await;
        debug!(task = %spawn_name, "task runner future finished");
    });

    active.insert(
        task_id,
        ActiveTask {
            cancel: Some(cancel_tx),
            handle,
        },
    );
}

fn cancel_task(task_id: TaskId, active: &mut HashMap<TaskId, ActiveTask>, mode: CancelMode) {
    let Some(mut existing) = active.remove(&task_id) else {
        debug!(task_id = %task_id, "cancel for a task with no running process");
        return;
    };

    if let Some(cancel) = existing.cancel.take() {
        if cancel.send(mode).is_err() {
            debug!(task_id = %task_id, "process already finished while cancelling");
        }
    }
}
