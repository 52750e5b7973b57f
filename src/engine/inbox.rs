// src/engine/inbox.rs

//! File-based command channel between CLI invocations and a running
//! scheduler.
//!
//! The scheduler owns the state snapshot, so a CLI process never writes it.
//! Mutating commands are dropped as JSON files into `<database>/inbox`; the
//! scheduler executes them on its next tick and writes the response to
//! `<database>/outbox` under the same id.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::command::{Command, CommandOutput};
use crate::errors::{FlowError, Result};
use crate::fs::FileSystem;

const INBOX_DIR: &str = "inbox";
const OUTBOX_DIR: &str = "outbox";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a command executed by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum CommandResponse {
    Completed(CommandOutput),
    Failed(String),
}

impl CommandResponse {
    pub fn into_result(self) -> Result<CommandOutput> {
        match self {
            CommandResponse::Completed(output) => Ok(output),
            CommandResponse::Failed(message) => Err(FlowError::Other(anyhow::anyhow!(message))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandInbox {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
}

impl CommandInbox {
    pub fn new(fs: Arc<dyn FileSystem>, database_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            dir: database_dir.into(),
        }
    }

    /// Queue a command; returns its id.
    pub fn submit(&self, command: &Command) -> Result<String> {
        command.validate()?;
        // Millisecond prefix keeps the inbox in submission order.
        let id = format!("{:013}-{}", Utc::now().timestamp_millis(), Uuid::new_v4());
        let body = serde_json::to_vec_pretty(command)?;
        self.fs.write(&self.inbox_path(&id), &body)?;
        debug!(id = %id, "command submitted");
        Ok(id)
    }

    /// Remove and return queued commands, oldest first. Entries that do not
    /// parse come back as errors so the caller can answer them.
    pub fn take_pending(&self) -> Result<Vec<(String, Result<Command>)>> {
        let inbox = self.dir.join(INBOX_DIR);
        if !self.fs.is_dir(&inbox) {
            return Ok(Vec::new());
        }

        let mut entries: Vec<(String, PathBuf)> = self
            .fs
            .read_dir(&inbox)?
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e == "json"))
            .filter_map(|p| Some((p.file_stem()?.to_str()?.to_string(), p)))
            .collect();
        entries.sort();

        let mut pending = Vec::with_capacity(entries.len());
        for (id, path) in entries {
            let parsed = self
                .fs
                .read_to_string(&path)
                .map_err(FlowError::from)
                .and_then(|body| Ok(serde_json::from_str::<Command>(&body)?));
            self.fs.remove_file(&path)?;
            pending.push((id, parsed));
        }
        Ok(pending)
    }

    pub fn respond(&self, id: &str, response: &CommandResponse) -> Result<()> {
        let body = serde_json::to_vec_pretty(response)?;
        self.fs.write(&self.outbox_path(id), &body)?;
        Ok(())
    }

    /// Wait for the response to command `id`, polling the outbox.
    pub async fn wait_response(&self, id: &str, timeout: Duration) -> Result<CommandResponse> {
        let path = self.outbox_path(id);
        let started = tokio::time::Instant::now();
        loop {
            if self.fs.is_file(&path) {
                let body = self.fs.read_to_string(&path)?;
                if let Err(e) = self.fs.remove_file(&path) {
                    warn!(id = %id, error = %e, "failed to remove command response");
                }
                return Ok(serde_json::from_str(&body)?);
            }
            if started.elapsed() >= timeout {
                return Err(FlowError::infrastructure(format!(
                    "no scheduler answered command {id} within {}s; is `sessionflow sched` running on this database?",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn inbox_path(&self, id: &str) -> PathBuf {
        entry_path(&self.dir.join(INBOX_DIR), id)
    }

    fn outbox_path(&self, id: &str) -> PathBuf {
        entry_path(&self.dir.join(OUTBOX_DIR), id)
    }
}

fn entry_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}
