// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{EngineSettings, ProjectDefinition};
use crate::types::{IntervalType, Params};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [server]
/// tick_interval = "1s"
/// database = ".sessionflow"
///
/// [project]
/// name = "etl"
///
/// [workflow.daily_load]
/// params = { region = "eu" }
/// retry = { limit = 2, interval = "30s", interval_type = "exponential" }
/// schedule = { daily = "07:00:00", timezone = "Asia/Tokyo" }
///
/// [[workflow.daily_load.task]]
/// name = "extract"
/// cmd = "./extract.sh"
///
/// [[workflow.daily_load.task]]
/// name = "load"
/// parallel = true
///
///   [[workflow.daily_load.task.task]]
///   name = "users"
///   cmd = "./load.sh users"
/// ```
///
/// Only `[project]` and at least one workflow are required.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub server: ServerSection,

    pub project: ProjectSection,

    /// Workflows keyed by name, in name order.
    #[serde(default)]
    pub workflow: BTreeMap<String, WorkflowConfig>,
}

/// `[server]` section. Durations use the `"500ms"`, `"10s"`, `"5m"` form.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,

    /// `"0s"` disables heartbeat supervision.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: String,

    /// How often running local tasks report liveness.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    #[serde(default = "default_max_catchup_ticks")]
    pub max_catchup_ticks: usize,

    /// Directory holding the state snapshot and command inbox.
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Directory for task logs; defaults to `<database>/logs`.
    #[serde(default)]
    pub task_log: Option<PathBuf>,
}

fn default_tick_interval() -> String {
    "1s".to_string()
}

fn default_heartbeat_timeout() -> String {
    "5m".to_string()
}

fn default_heartbeat_interval() -> String {
    "10s".to_string()
}

fn default_max_catchup_ticks() -> usize {
    100
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            max_catchup_ticks: default_max_catchup_ticks(),
            database: None,
            task_log: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    pub name: String,
}

/// `[workflow.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub params: Params,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Run the top-level tasks concurrently.
    #[serde(default)]
    pub parallel: bool,

    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,

    #[serde(default)]
    pub task: Vec<TaskConfig>,
}

/// `[[...task]]` entry: a command, or a group of nested tasks.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,

    #[serde(default)]
    pub cmd: Option<String>,

    #[serde(default)]
    pub params: Params,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub parallel: bool,

    /// Sibling names or fully qualified names (`+wf+group+task`).
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub task: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub limit: u32,

    #[serde(default)]
    pub interval: Option<String>,

    #[serde(default)]
    pub interval_type: IntervalType,
}

/// Exactly one of `cron`, `interval`, `hourly` and `daily` must be set.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// 5-field (minute precision) or 6-field (with seconds) cron expression.
    #[serde(default)]
    pub cron: Option<String>,

    #[serde(default)]
    pub interval: Option<String>,

    /// `"MM:SS"` into every hour.
    #[serde(default)]
    pub hourly: Option<String>,

    /// `"HH:MM:SS"` into every day.
    #[serde(default)]
    pub daily: Option<String>,

    /// IANA name; UTC when absent.
    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default)]
    pub delay: Option<String>,

    #[serde(default)]
    pub skip_on_overtime: bool,
}

/// Server settings with durations parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub tick_interval: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub heartbeat_interval: Duration,
    pub max_catchup_ticks: usize,
    pub database: Option<PathBuf>,
    pub task_log: Option<PathBuf>,
}

impl ServerConfig {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            heartbeat_timeout: self.heartbeat_timeout,
            max_catchup_ticks: self.max_catchup_ticks,
        }
    }
}

/// Validated configuration. Built from [`RawConfigFile`] via `TryFrom`,
/// which compiles every workflow graph and schedule.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub server: ServerConfig,
    pub project: ProjectDefinition,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(server: ServerConfig, project: ProjectDefinition) -> Self {
        Self { server, project }
    }
}
