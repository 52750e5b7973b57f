// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::{AttemptId, Params, ScheduleId, SessionId};

/// Command-line arguments for `sessionflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sessionflow",
    version,
    about = "Schedule workflow sessions and run their task graphs.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, global = true, value_name = "PATH", default_value = "sessionflow.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SESSIONFLOW_LOG` or `info` is used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// State directory; overrides `[server].database`.
    #[arg(long, global = true, value_name = "DIR")]
    pub database: Option<PathBuf>,

    /// Keep state in memory only (`sched`); nothing survives a restart.
    #[arg(long, global = true)]
    pub memory: bool,

    /// Task log directory; overrides `[server].task_log`.
    #[arg(long, global = true, value_name = "DIR")]
    pub task_log: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CliCommand {
    /// Run the scheduler: fire schedules, run tasks, serve queued commands.
    Sched,

    /// Validate the config and print the workflows, without running anything.
    Check,

    /// Start a session of a workflow.
    Start {
        workflow: String,
        /// Session time (RFC 3339, `YYYY-MM-DD[ HH:MM:SS]` in UTC, or `now`).
        #[arg(long, value_name = "TIME", default_value = "now", value_parser = parse_session_time)]
        session: SessionTimeArg,
        #[command(flatten)]
        params: ParamArgs,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Start a new attempt of a finished session.
    Retry {
        #[command(flatten)]
        target: RetryTargetArgs,
        /// Name of the new attempt (unique within the session).
        #[arg(long)]
        name: String,
        /// Re-run only the tasks that did not succeed.
        #[arg(long)]
        failed: bool,
        #[command(flatten)]
        params: ParamArgs,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Run past sessions of a schedule.
    Backfill {
        schedule_id: ScheduleId,
        /// First session time to run (inclusive).
        #[arg(long, value_parser = parse_time)]
        from: DateTime<Utc>,
        /// Attempt name used for every backfilled session.
        #[arg(long)]
        name: String,
        /// Show the sessions that would run without creating anything.
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Move a schedule's next run forward.
    Reschedule {
        schedule_id: ScheduleId,
        #[command(flatten)]
        target: RescheduleArgs,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Kill a running attempt.
    Kill {
        attempt_id: AttemptId,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// List schedules.
    Schedules,

    /// List sessions.
    Sessions {
        #[arg(long)]
        workflow: Option<String>,
    },

    /// List attempts.
    Attempts {
        #[arg(long)]
        workflow: Option<String>,
    },

    /// Show the tasks of an attempt.
    Tasks { attempt_id: AttemptId },

    /// Print the task logs of an attempt.
    Log { attempt_id: AttemptId },
}

#[derive(Debug, Clone, Args)]
#[group(required = true, multiple = false)]
pub struct RetryTargetArgs {
    #[arg(long, value_name = "ID")]
    pub attempt: Option<AttemptId>,
    #[arg(long, value_name = "ID")]
    pub session: Option<SessionId>,
}

#[derive(Debug, Clone, Args)]
#[group(required = true, multiple = false)]
pub struct RescheduleArgs {
    /// New next run time.
    #[arg(long, value_parser = parse_time)]
    pub run_at: Option<DateTime<Utc>>,
    /// Skip this many upcoming sessions.
    #[arg(long)]
    pub skip: Option<u32>,
    /// Skip every session before this time.
    #[arg(long, value_parser = parse_time)]
    pub skip_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Args, Default)]
pub struct ParamArgs {
    /// Parameter override, `KEY=VALUE`; VALUE is JSON when it parses.
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, serde_json::Value)>,
}

impl ParamArgs {
    pub fn to_params(&self) -> Params {
        self.params.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Args)]
pub struct WaitArgs {
    /// Seconds to wait for the scheduler to answer.
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub wait: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTimeArg {
    Now,
    At(DateTime<Utc>),
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Parse `KEY=VALUE`.
pub fn parse_param(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{s}'"));
    }
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Parse RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD` (both UTC).
pub fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(t.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t.and_utc());
        }
    }
    Err(format!(
        "invalid time '{s}'; expected RFC 3339, 'YYYY-MM-DD HH:MM:SS' or 'YYYY-MM-DD'"
    ))
}

fn parse_session_time(s: &str) -> Result<SessionTimeArg, String> {
    if s.trim().eq_ignore_ascii_case("now") {
        Ok(SessionTimeArg::Now)
    } else {
        parse_time(s).map(SessionTimeArg::At)
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
