// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{
    ConfigFile, RawConfigFile, RetryConfig, ScheduleConfig, ServerConfig, ServerSection,
    TaskConfig, WorkflowConfig,
};
use crate::dag::{self, TaskDefinition, WorkflowDefinition};
use crate::engine::{ProjectDefinition, WorkflowEntry};
use crate::errors::{FlowError, Result};
use crate::timeline::{parse_clock_offset, RecurrenceSpec, ScheduleSpec};
use crate::types::{parse_duration, RetryPolicy};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = FlowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let server = server_config(&raw.server)?;
        let project = project_definition(&raw)?;
        Ok(ConfigFile::new_unchecked(server, project))
    }
}

fn config_error(msg: impl Into<String>) -> FlowError {
    FlowError::Config(msg.into())
}

fn duration_field(section: &str, field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_error(format!("{section}.{field}: {e}")))
}

fn server_config(raw: &ServerSection) -> Result<ServerConfig> {
    let tick_interval = duration_field("[server]", "tick_interval", &raw.tick_interval)?;
    if tick_interval.is_zero() {
        return Err(config_error("[server].tick_interval must be > 0"));
    }
    let heartbeat_interval =
        duration_field("[server]", "heartbeat_interval", &raw.heartbeat_interval)?;
    if heartbeat_interval.is_zero() {
        return Err(config_error("[server].heartbeat_interval must be > 0"));
    }
    let heartbeat_timeout =
        duration_field("[server]", "heartbeat_timeout", &raw.heartbeat_timeout)?;
    if !heartbeat_timeout.is_zero() && heartbeat_timeout <= heartbeat_interval {
        return Err(config_error(format!(
            "[server].heartbeat_timeout ({}) must exceed heartbeat_interval ({})",
            raw.heartbeat_timeout, raw.heartbeat_interval
        )));
    }
    if raw.max_catchup_ticks == 0 {
        return Err(config_error("[server].max_catchup_ticks must be >= 1 (got 0)"));
    }

    Ok(ServerConfig {
        tick_interval,
        heartbeat_timeout: (!heartbeat_timeout.is_zero()).then_some(heartbeat_timeout),
        heartbeat_interval,
        max_catchup_ticks: raw.max_catchup_ticks,
        database: raw.database.clone(),
        task_log: raw.task_log.clone(),
    })
}

fn project_definition(raw: &RawConfigFile) -> Result<ProjectDefinition> {
    let name = raw.project.name.trim();
    if name.is_empty() || name.contains('/') {
        return Err(config_error(format!(
            "[project].name must be non-empty and contain no '/' (got '{}')",
            raw.project.name
        )));
    }
    if raw.workflow.is_empty() {
        return Err(config_error(
            "config must contain at least one [workflow.<name>] section",
        ));
    }

    let mut workflows = Vec::with_capacity(raw.workflow.len());
    for (wf_name, wf) in &raw.workflow {
        let definition = workflow_definition(wf_name, wf)?;
        // Graph construction rejects cycles and unknown `after` references.
        dag::build(&definition)
            .map_err(|e| config_error(format!("workflow '{wf_name}': {e}")))?;

        let schedule = wf
            .schedule
            .as_ref()
            .map(|s| schedule_spec(wf_name, s))
            .transpose()?;
        workflows.push(WorkflowEntry {
            definition,
            schedule,
        });
    }

    Ok(ProjectDefinition {
        name: name.to_string(),
        workflows,
    })
}

fn workflow_definition(name: &str, wf: &WorkflowConfig) -> Result<WorkflowDefinition> {
    let section = format!("[workflow.{name}]");
    if wf.task.is_empty() {
        return Err(config_error(format!("{section} has no tasks")));
    }
    let tasks = wf
        .task
        .iter()
        .map(|t| task_definition(&section, t))
        .collect::<Result<Vec<_>>>()?;

    Ok(WorkflowDefinition {
        name: name.to_string(),
        params: wf.params.clone(),
        retry: wf
            .retry
            .as_ref()
            .map(|r| retry_policy(&section, r))
            .transpose()?,
        parallel: wf.parallel,
        tasks,
    })
}

fn task_definition(parent: &str, task: &TaskConfig) -> Result<TaskDefinition> {
    let section = format!("{parent} task '{}'", task.name);
    let tasks = task
        .task
        .iter()
        .map(|t| task_definition(&section, t))
        .collect::<Result<Vec<_>>>()?;

    Ok(TaskDefinition {
        name: task.name.clone(),
        command: task.cmd.clone(),
        params: task.params.clone(),
        retry: task
            .retry
            .as_ref()
            .map(|r| retry_policy(&section, r))
            .transpose()?,
        parallel: task.parallel,
        after: task.after.clone(),
        tasks,
    })
}

fn retry_policy(section: &str, retry: &RetryConfig) -> Result<RetryPolicy> {
    let interval = match &retry.interval {
        Some(s) => duration_field(section, "retry.interval", s)?,
        None => Duration::ZERO,
    };
    Ok(RetryPolicy {
        limit: retry.limit,
        interval,
        interval_type: retry.interval_type,
    })
}

fn schedule_spec(workflow: &str, cfg: &ScheduleConfig) -> Result<ScheduleSpec> {
    let section = format!("[workflow.{workflow}].schedule");
    let mut kinds = Vec::new();

    if let Some(expr) = &cfg.cron {
        kinds.push(RecurrenceSpec::Cron { expr: expr.clone() });
    }
    if let Some(s) = &cfg.interval {
        let every = duration_field(&section, "interval", s)?;
        kinds.push(RecurrenceSpec::Interval {
            seconds: every.as_secs(),
        });
    }
    if let Some(s) = &cfg.hourly {
        let at_seconds =
            parse_clock_offset(s).map_err(|e| config_error(format!("{section}.hourly: {e}")))?;
        kinds.push(RecurrenceSpec::Hourly { at_seconds });
    }
    if let Some(s) = &cfg.daily {
        let at_seconds =
            parse_clock_offset(s).map_err(|e| config_error(format!("{section}.daily: {e}")))?;
        kinds.push(RecurrenceSpec::Daily { at_seconds });
    }

    let recurrence = match kinds.len() {
        1 => kinds.remove(0),
        0 => {
            return Err(config_error(format!(
                "{section} needs one of cron, interval, hourly, daily"
            )))
        }
        _ => {
            return Err(config_error(format!(
                "{section} sets more than one of cron, interval, hourly, daily"
            )))
        }
    };

    let delay_seconds = match &cfg.delay {
        Some(s) => duration_field(&section, "delay", s)?.as_secs(),
        None => 0,
    };

    let spec = ScheduleSpec {
        recurrence,
        timezone: cfg.timezone.clone().unwrap_or_else(|| "UTC".to_string()),
        delay_seconds,
        skip_on_overtime: cfg.skip_on_overtime,
    };
    spec.compile()
        .map_err(|e| config_error(format!("{section}: {e}")))?;
    Ok(spec)
}
