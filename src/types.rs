// src/types.rs

//! Identifiers, state enums and small value types shared across the engine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Input / output parameters of attempts and tasks.
pub type Params = serde_json::Map<String, serde_json::Value>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<u64>()
                    .map($name)
                    .map_err(|e| format!("invalid {} '{}': {}", stringify!($name), s, e))
            }
        }
    };
}

id_type!(
    /// Store-assigned schedule identifier.
    ScheduleId
);
id_type!(
    /// Store-assigned session identifier.
    SessionId
);
id_type!(
    /// Store-assigned attempt identifier.
    AttemptId
);
id_type!(
    /// Store-assigned task identifier, unique across attempts.
    TaskId
);

/// A workflow within a project. Together with a session time this is the
/// deduplication key of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub project: String,
    pub workflow: String,
}

impl WorkflowRef {
    pub fn new(project: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            workflow: workflow.into(),
        }
    }
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.workflow)
    }
}

/// Lifecycle of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Running,
    Success,
    Error,
    Killed,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Success | AttemptState::Error | AttemptState::Killed
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptState::Pending => "pending",
            AttemptState::Running => "running",
            AttemptState::Success => "success",
            AttemptState::Error => "error",
            AttemptState::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Per-task state inside one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on dependencies or on the parent group to start.
    Blocked,
    /// Dependencies satisfied; waiting to be handed to the agent pool.
    Ready,
    /// Dispatched (command task) or executing its children (group task).
    Running,
    Success,
    Error,
    /// Failed with retry budget left; redispatched once `retry_at` passes.
    RetryWaiting,
    /// Never ran (upstream failure or kill) or was stopped by a kill.
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Error | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Blocked => "blocked",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Error => "error",
            TaskState::RetryWaiting => "retry_waiting",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Which tasks a retry re-executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Every task starts from scratch.
    #[default]
    All,
    /// Tasks that succeeded in the previous attempt are carried over.
    Failed,
}

impl FromStr for RetryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(RetryMode::All),
            "failed" => Ok(RetryMode::Failed),
            other => Err(format!(
                "invalid retry mode: {other} (expected \"all\" or \"failed\")"
            )),
        }
    }
}

/// How the wait between task retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntervalType {
    #[default]
    Constant,
    Exponential,
}

/// Task-level retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryPolicy {
    /// Number of redispatches allowed after the first failure.
    pub limit: u32,
    /// Base wait before a redispatch.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub interval_type: IntervalType,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    /// Backoff before redispatch number `retry_count` (1-based).
    pub fn backoff(&self, retry_count: u32) -> Duration {
        match self.interval_type {
            IntervalType::Constant => self.interval,
            IntervalType::Exponential => {
                let shift = retry_count.saturating_sub(1).min(16);
                self.interval.saturating_mul(1u32 << shift)
            }
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Parse a short duration string such as `"500ms"`, `"10s"`, `"5m"`, `"2h"`
/// or `"1d"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    let secs_per_unit: u64 = match unit.as_str() {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => {
            return Err(format!(
                "unsupported duration unit '{}'; expected ms, s, m, h, or d",
                unit
            ))
        }
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", s))
}
