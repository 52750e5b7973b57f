// src/exec/task_runner.rs

//! Individual task process runner.

use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::engine::RuntimeEvent;
use crate::exec::backend::{AgentEvent, DispatchRequest};
use crate::executor::TaskOutcome;
use crate::storage::{task_log_key, ObjectStorage};
use crate::types::Params;

/// Prefix of stdout lines that set an output parameter.
pub const SET_OUTPUT_PREFIX: &str = "::set-output ";

/// Environment variable carrying the task's input params as JSON.
pub const PARAMS_ENV: &str = "SESSIONFLOW_PARAMS";

/// How a cancelled runner reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Send `CancelAcknowledged` after killing the process.
    Acknowledge,
    /// Kill without reporting (the task was redispatched).
    Silent,
}

/// Run a single task process and report its outcome.
///
/// - Output of the process (stdout and stderr, interleaved by line) is
///   stored as the task log.
/// - A heartbeat is sent every `heartbeat_interval` while it runs.
/// - On cancellation the process is killed and **no** `Completed` event is
///   sent for it.
pub async fn run_task(
    request: DispatchRequest,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    storage: Arc<dyn ObjectStorage>,
    cancel_rx: oneshot::Receiver<CancelMode>,
    heartbeat_interval: Duration,
) {
    let task_id = request.task_id;
    let task_name = request.task_name.clone();
    if let Err(err) =
        run_task_inner(request, &runtime_tx, storage, cancel_rx, heartbeat_interval).await
    {
        error!(
            task_id = %task_id,
            task = %task_name,
            error = %err,
            "task execution error"
        );
        let _ = runtime_tx
            .send(RuntimeEvent::Agent(AgentEvent::Completed {
                task_id,
                outcome: TaskOutcome::Error(format!("{err:#}")),
            }))
            .await;
    }
}

async fn run_task_inner(
    request: DispatchRequest,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
    storage: Arc<dyn ObjectStorage>,
    mut cancel_rx: oneshot::Receiver<CancelMode>,
    heartbeat_interval: Duration,
) -> Result<()> {
    info!(
        task_id = %request.task_id,
        task = %request.task_name,
        cmd = %request.command,
        "starting task process"
    );
    let started_at = Utc::now();

    // Build a shell command appropriate for the platform.
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&request.command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&request.command);
        c
    };

    let params_json =
        serde_json::to_string(&request.params).context("serializing task params")?;
    cmd.env(PARAMS_ENV, params_json)
        .env("SESSIONFLOW_TASK_NAME", &request.task_name)
        .env("SESSIONFLOW_ATTEMPT_ID", request.attempt_id.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for task '{}'", request.task_name))?;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, line_tx.clone());
    }
    drop(line_tx);

    let mut log = String::new();
    let mut outputs = Params::new();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Either the process exits on its own (normal case), or we receive a
    // cancellation request.
    let status = loop {
        tokio::select! {
            Some(line) = line_rx.recv() => {
                absorb_line(&line, &mut log, &mut outputs);
            }

            _ = heartbeat.tick() => {
                let _ = runtime_tx
                    .send(RuntimeEvent::Agent(AgentEvent::Heartbeat { task_id: request.task_id }))
                    .await;
            }

            status_res = child.wait() => {
                break status_res.with_context(|| {
                    format!("waiting for process of task '{}'", request.task_name)
                })?;
            }

            cancel = &mut cancel_rx => {
                let mode = cancel.unwrap_or(CancelMode::Silent);
                info!(
                    task_id = %request.task_id,
                    task = %request.task_name,
                    ?mode,
                    "cancellation requested for running task; killing process"
                );
                if let Err(e) = child.kill().await {
                    warn!(
                        task = %request.task_name,
                        error = %e,
                        "failed to kill child process on cancellation"
                    );
                }
                log.push_str("-- killed by cancellation --\n");
                store_log(&storage, &request, started_at, log).await;
                if mode == CancelMode::Acknowledge {
                    runtime_tx
                        .send(RuntimeEvent::Agent(AgentEvent::CancelAcknowledged {
                            task_id: request.task_id,
                        }))
                        .await
                        .context("sending CancelAcknowledged to runtime")?;
                }
                return Ok(());
            }
        }
    };

    // Readers end once the process closed its pipes.
    while let Some(line) = line_rx.recv().await {
        absorb_line(&line, &mut log, &mut outputs);
    }

    let code = status.code().unwrap_or(-1);
    info!(
        task_id = %request.task_id,
        task = %request.task_name,
        exit_code = code,
        success = status.success(),
        "task process exited"
    );
    store_log(&storage, &request, started_at, log).await;

    let outcome = if status.success() {
        TaskOutcome::Success(outputs)
    } else {
        TaskOutcome::Error(format!("command exited with code {code}"))
    };
    runtime_tx
        .send(RuntimeEvent::Agent(AgentEvent::Completed {
            task_id: request.task_id,
            outcome,
        }))
        .await
        .with_context(|| {
            format!(
                "sending Completed event for task '{}' to runtime",
                request.task_name
            )
        })?;

    Ok(())
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

fn absorb_line(line: &str, log: &mut String, outputs: &mut Params) {
    log.push_str(line);
    log.push('\n');
    if let Some((key, value)) = parse_set_output(line) {
        debug!(key = %key, "task set output parameter");
        outputs.insert(key, value);
    }
}

/// Parse `::set-output key=value`. The value is taken as JSON when it
/// parses, as a plain string otherwise.
pub fn parse_set_output(line: &str) -> Option<(String, serde_json::Value)> {
    let rest = line.trim_end().strip_prefix(SET_OUTPUT_PREFIX)?;
    let (key, raw) = rest.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Some((key.to_string(), value))
}

async fn store_log(
    storage: &Arc<dyn ObjectStorage>,
    request: &DispatchRequest,
    started_at: chrono::DateTime<Utc>,
    log: String,
) {
    let key = task_log_key(request.attempt_id, &request.task_name, started_at);
    let storage = Arc::clone(storage);
    let data = log.into_bytes();
    let size = data.len() as u64;
    let put_key = key.clone();

    let result = tokio::task::spawn_blocking(move || {
        let provider = move || -> anyhow::Result<Box<dyn std::io::Read + Send>> {
            Ok(Box::new(Cursor::new(data.clone())))
        };
        storage.put(&put_key, size, &provider)
    })
    .await;

    match result {
        Ok(Ok(checksum)) => debug!(key = %key, %checksum, "task log stored"),
        Ok(Err(e)) => warn!(key = %key, error = %e, "failed to store task log"),
        Err(e) => warn!(key = %key, error = %e, "task log writer panicked"),
    }
}
