// src/engine/command.rs

//! Operator commands as one flat enum.
//!
//! The CLI builds a [`Command`], and the scheduler executes it (directly,
//! or after picking it up from the [`CommandInbox`](super::CommandInbox)).
//! Commands serialize to JSON so they can cross that process boundary.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::coordinator::{AttemptSummary, RetryTarget};
use super::queries::{ScheduleSummary, TaskLog};
use super::Engine;
use crate::errors::{FlowError, Result};
use crate::store::{AttemptRecord, RecordFilter, SessionRecord, TaskRecord};
use crate::timeline::SkipTarget;
use crate::types::{AttemptId, Params, RetryMode, ScheduleId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Start a workflow's session. Without a session time the current time
    /// (whole seconds) is used.
    Start {
        project: String,
        workflow: String,
        session_time: Option<DateTime<Utc>>,
        #[serde(default)]
        params: Params,
    },
    Retry {
        target: RetryTarget,
        name: String,
        #[serde(default)]
        mode: RetryMode,
        params: Option<Params>,
    },
    Backfill {
        schedule_id: ScheduleId,
        from: DateTime<Utc>,
        attempt_name: String,
        #[serde(default)]
        dry_run: bool,
    },
    /// Without a schedule time, the session aligned to the run time is used.
    Reschedule {
        schedule_id: ScheduleId,
        next_run_time: DateTime<Utc>,
        next_schedule_time: Option<DateTime<Utc>>,
    },
    Skip {
        schedule_id: ScheduleId,
        target: SkipTarget,
    },
    Kill {
        attempt_id: AttemptId,
    },
    ShowSchedules,
    ShowSessions {
        #[serde(default)]
        filter: RecordFilter,
    },
    ShowAttempts {
        #[serde(default)]
        filter: RecordFilter,
    },
    ShowTasks {
        attempt_id: AttemptId,
    },
    ShowLogs {
        attempt_id: AttemptId,
    },
}

/// Result of an executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandOutput {
    Attempt(AttemptRecord),
    Planned(Vec<AttemptSummary>),
    Schedule(ScheduleSummary),
    Schedules(Vec<ScheduleSummary>),
    Sessions(Vec<SessionRecord>),
    Attempts(Vec<AttemptRecord>),
    Tasks(Vec<TaskRecord>),
    Logs(Vec<TaskLog>),
}

impl Command {
    /// Read-only commands, answerable from the state snapshot alone.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Command::ShowSchedules
                | Command::ShowSessions { .. }
                | Command::ShowAttempts { .. }
                | Command::ShowTasks { .. }
                | Command::ShowLogs { .. }
        )
    }

    /// Check argument shape without looking at engine state.
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::Start {
                project, workflow, ..
            } => {
                if project.trim().is_empty() || workflow.trim().is_empty() {
                    return Err(FlowError::validation("project and workflow are required"));
                }
            }
            Command::Retry { name, .. } if name.trim().is_empty() => {
                return Err(FlowError::validation("retry attempt name must not be empty"));
            }
            Command::Backfill { attempt_name, .. } if attempt_name.trim().is_empty() => {
                return Err(FlowError::validation("backfill attempt name must not be empty"));
            }
            Command::Reschedule {
                next_run_time,
                next_schedule_time: Some(sched),
                ..
            } if sched > next_run_time => {
                return Err(FlowError::validation(format!(
                    "schedule time {sched} is after run time {next_run_time}"
                )));
            }
            Command::Skip {
                target: SkipTarget::Count(0),
                ..
            } => return Err(FlowError::validation("skip count must be at least 1")),
            _ => {}
        }
        Ok(())
    }

    pub fn execute(&self, engine: &Engine, now: DateTime<Utc>) -> Result<CommandOutput> {
        self.validate()?;
        let output = match self {
            Command::Start {
                project,
                workflow,
                session_time,
                params,
            } => {
                let session_time = session_time.unwrap_or_else(|| now.trunc_subsecs(0));
                CommandOutput::Attempt(engine.start(project, workflow, session_time, params.clone())?)
            }
            Command::Retry {
                target,
                name,
                mode,
                params,
            } => CommandOutput::Attempt(engine.retry(*target, name, *mode, params.clone())?),
            Command::Backfill {
                schedule_id,
                from,
                attempt_name,
                dry_run,
            } => CommandOutput::Planned(engine.backfill(*schedule_id, *from, attempt_name, *dry_run)?),
            Command::Reschedule {
                schedule_id,
                next_run_time,
                next_schedule_time,
            } => {
                let sched = match next_schedule_time {
                    Some(t) => *t,
                    None => engine.aligned_schedule_time(*schedule_id, *next_run_time)?,
                };
                CommandOutput::Schedule(engine.reschedule(*schedule_id, *next_run_time, sched)?)
            }
            Command::Skip {
                schedule_id,
                target,
            } => CommandOutput::Schedule(engine.skip_schedule(*schedule_id, *target)?),
            Command::Kill { attempt_id } => CommandOutput::Attempt(engine.kill(*attempt_id)?),
            Command::ShowSchedules => CommandOutput::Schedules(engine.schedules()?),
            Command::ShowSessions { filter } => CommandOutput::Sessions(engine.sessions(filter)?),
            Command::ShowAttempts { filter } => CommandOutput::Attempts(engine.attempts(filter)?),
            Command::ShowTasks { attempt_id } => CommandOutput::Tasks(engine.tasks(*attempt_id)?),
            Command::ShowLogs { attempt_id } => CommandOutput::Logs(engine.task_logs(*attempt_id)?),
        };
        Ok(output)
    }
}

fn or_dash<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn write_attempt(f: &mut fmt::Formatter<'_>, a: &AttemptRecord) -> fmt::Result {
    writeln!(f, "  attempt id: {}", a.id)?;
    writeln!(f, "  session id: {}", a.session_id)?;
    writeln!(f, "  workflow: {}", a.workflow)?;
    writeln!(f, "  session time: {}", a.session_time.to_rfc3339())?;
    writeln!(f, "  retry attempt name: {}", or_dash(a.retry_attempt_name.as_deref()))?;
    writeln!(f, "  params: {}", serde_json::Value::Object(a.params.clone()))?;
    writeln!(f, "  created at: {}", a.created_at.to_rfc3339())?;
    writeln!(f, "  status: {}{}", a.state, if a.kill_requested && !a.done { " (killing)" } else { "" })?;
    writeln!(f, "  finished at: {}", or_dash(a.finished_at.map(|t| t.to_rfc3339())))
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutput::Attempt(a) => write_attempt(f, a),
            CommandOutput::Planned(list) => {
                for s in list {
                    writeln!(f, "  session time: {}", s.session_time.to_rfc3339())?;
                    writeln!(f, "  attempt id: {}", or_dash(s.id))?;
                    writeln!(f, "  session id: {}", or_dash(s.session_id))?;
                    writeln!(f, "  retry attempt name: {}", or_dash(s.retry_attempt_name.as_deref()))?;
                    writeln!(f)?;
                }
                writeln!(f, "{} attempts", list.len())
            }
            CommandOutput::Schedule(s) => {
                writeln!(f, "  id: {}", s.id)?;
                writeln!(f, "  workflow: {}", s.workflow)?;
                writeln!(f, "  timezone: {}", s.timezone)?;
                writeln!(f, "  next session time: {}", s.next_schedule_time)?;
                writeln!(f, "  next run time: {}", s.next_run_time.to_rfc3339())
            }
            CommandOutput::Schedules(list) => {
                for s in list {
                    writeln!(
                        f,
                        "{:>5}  {:<30} next run {}  session {}",
                        s.id,
                        s.workflow.to_string(),
                        s.next_run_time.to_rfc3339(),
                        s.next_schedule_time
                    )?;
                }
                Ok(())
            }
            CommandOutput::Sessions(list) => {
                for s in list {
                    writeln!(
                        f,
                        "{:>5}  {}  {:<30} {}",
                        s.id,
                        s.uuid,
                        s.workflow.to_string(),
                        s.session_time.to_rfc3339()
                    )?;
                }
                Ok(())
            }
            CommandOutput::Attempts(list) => {
                for a in list {
                    writeln!(
                        f,
                        "{:>5}  session {:<5} {:<30} {}  {:<8} {}",
                        a.id,
                        a.session_id,
                        a.workflow.to_string(),
                        a.session_time.to_rfc3339(),
                        a.state.to_string(),
                        or_dash(a.retry_attempt_name.as_deref())
                    )?;
                }
                Ok(())
            }
            CommandOutput::Tasks(list) => {
                for t in list {
                    writeln!(
                        f,
                        "{:>6}  {:<40} {:<13} retries {}{}",
                        t.id,
                        t.name,
                        t.state.to_string(),
                        t.retry_count,
                        t.error.as_deref().map(|e| format!("  error: {e}")).unwrap_or_default()
                    )?;
                }
                Ok(())
            }
            CommandOutput::Logs(list) => {
                for log in list {
                    writeln!(
                        f,
                        "=== {} ({}) ===",
                        log.task_name,
                        or_dash(log.started_at.map(|t| t.to_rfc3339()))
                    )?;
                    f.write_str(&log.content)?;
                }
                Ok(())
            }
        }
    }
}
