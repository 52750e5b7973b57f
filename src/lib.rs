// src/lib.rs

pub mod cli;
pub mod clock;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod executor;
pub mod fs;
pub mod locks;
pub mod logging;
pub mod registry;
pub mod storage;
pub mod store;
pub mod timeline;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::{CliArgs, CliCommand, RescheduleArgs, SessionTimeArg};
use crate::clock::SystemClock;
use crate::config::{load_and_validate, ConfigFile};
use crate::engine::{
    Command, CommandInbox, Engine, RetryTarget, Runtime, RuntimeEvent, RuntimeOptions,
};
use crate::exec::{DetachedAgentPool, LocalAgentPool, LocalAgentSettings};
use crate::fs::{FileSystem, RealFileSystem};
use crate::storage::{LocalStorage, MemoryStorage, ObjectStorage};
use crate::store::{MemoryStore, RecordFilter, SnapshotStore, Store};
use crate::timeline::SkipTarget;
use crate::types::RetryMode;

/// State directory used when neither `--database` nor `[server].database`
/// is given.
pub const DEFAULT_DATABASE_DIR: &str = ".sessionflow";

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;

    match &args.command {
        CliCommand::Check => {
            print_check(&cfg);
            Ok(())
        }
        CliCommand::Sched => run_scheduler(&args, cfg).await,
        command => run_client(&args, &cfg, command).await,
    }
}

fn database_dir(args: &CliArgs, cfg: &ConfigFile) -> PathBuf {
    args.database
        .clone()
        .or_else(|| cfg.server.database.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_DIR))
}

fn task_log_dir(args: &CliArgs, cfg: &ConfigFile) -> Option<PathBuf> {
    args.task_log.clone().or_else(|| cfg.server.task_log.clone())
}

/// Run the scheduler until Ctrl-C.
///
/// This wires together:
/// - the store (snapshot in the database dir, or memory)
/// - task log storage
/// - the local agent pool
/// - the engine, with the config's project applied and unfinished
///   attempts recovered
/// - the command inbox and Ctrl-C handling
async fn run_scheduler(args: &CliArgs, cfg: ConfigFile) -> Result<()> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let database = database_dir(args, &cfg);

    let store: Arc<dyn Store> = if args.memory {
        info!("using in-memory state; nothing persists across restarts");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SnapshotStore::open(Arc::clone(&fs), &database)?)
    };

    let storage: Arc<dyn ObjectStorage> = match task_log_dir(args, &cfg) {
        Some(dir) => Arc::new(LocalStorage::new(Arc::clone(&fs), dir)),
        None if args.memory => Arc::new(MemoryStorage::new()),
        None => Arc::new(LocalStorage::new(Arc::clone(&fs), database.join("logs"))),
    };

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(256);

    let agents = LocalAgentPool::spawn(
        rt_tx.clone(),
        Arc::clone(&storage),
        LocalAgentSettings {
            heartbeat_interval: cfg.server.heartbeat_interval,
            ..LocalAgentSettings::default()
        },
    );

    let engine = Arc::new(Engine::new(
        store,
        Arc::new(agents),
        storage,
        Arc::new(SystemClock),
        cfg.server.engine_settings(),
    ));
    engine.apply_project(&cfg.project)?;
    engine.recover()?;

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    let options = RuntimeOptions {
        tick_interval: cfg.server.tick_interval,
        exit_when_idle: false,
    };
    let mut runtime = Runtime::new(engine, rt_rx, options);
    if !args.memory {
        runtime = runtime.with_inbox(CommandInbox::new(fs, &database));
    }
    runtime.run().await?;
    Ok(())
}

/// Operator commands. Queries read the state snapshot directly; everything
/// else is queued for the running scheduler, which owns the state.
async fn run_client(args: &CliArgs, cfg: &ConfigFile, cli_command: &CliCommand) -> Result<()> {
    let (command, wait) = to_command(cfg, cli_command)?;
    command.validate()?;

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let database = database_dir(args, cfg);

    let output = if command.is_query() {
        let storage_dir = task_log_dir(args, cfg).unwrap_or_else(|| database.join("logs"));
        let engine = Engine::new(
            Arc::new(SnapshotStore::open(Arc::clone(&fs), &database)?),
            Arc::new(DetachedAgentPool),
            Arc::new(LocalStorage::new(Arc::clone(&fs), storage_dir)),
            Arc::new(SystemClock),
            cfg.server.engine_settings(),
        );
        command.execute(&engine, Utc::now())?
    } else {
        let inbox = CommandInbox::new(fs, &database);
        let id = inbox.submit(&command)?;
        debug!(id = %id, "waiting for scheduler");
        inbox
            .wait_response(&id, Duration::from_secs(wait))
            .await?
            .into_result()?
    };

    print!("{output}");
    Ok(())
}

/// Translate CLI arguments into an engine command plus the answer timeout.
fn to_command(cfg: &ConfigFile, cli_command: &CliCommand) -> Result<(Command, u64)> {
    let project = cfg.project.name.clone();
    let command = match cli_command {
        CliCommand::Start {
            workflow,
            session,
            params,
            wait,
        } => (
            Command::Start {
                project,
                workflow: workflow.clone(),
                session_time: match session {
                    SessionTimeArg::Now => None,
                    SessionTimeArg::At(t) => Some(*t),
                },
                params: params.to_params(),
            },
            wait.wait,
        ),
        CliCommand::Retry {
            target,
            name,
            failed,
            params,
            wait,
        } => {
            let target = match (target.attempt, target.session) {
                (Some(id), _) => RetryTarget::Attempt(id),
                (None, Some(id)) => RetryTarget::Session(id),
                (None, None) => anyhow::bail!("one of --attempt or --session is required"),
            };
            let params = params.to_params();
            (
                Command::Retry {
                    target,
                    name: name.clone(),
                    mode: if *failed { RetryMode::Failed } else { RetryMode::All },
                    params: (!params.is_empty()).then_some(params),
                },
                wait.wait,
            )
        }
        CliCommand::Backfill {
            schedule_id,
            from,
            name,
            dry_run,
            wait,
        } => (
            Command::Backfill {
                schedule_id: *schedule_id,
                from: *from,
                attempt_name: name.clone(),
                dry_run: *dry_run,
            },
            wait.wait,
        ),
        CliCommand::Reschedule {
            schedule_id,
            target,
            wait,
        } => (reschedule_command(*schedule_id, target)?, wait.wait),
        CliCommand::Kill { attempt_id, wait } => (
            Command::Kill {
                attempt_id: *attempt_id,
            },
            wait.wait,
        ),
        CliCommand::Schedules => (Command::ShowSchedules, 0),
        CliCommand::Sessions { workflow } => (
            Command::ShowSessions {
                filter: workflow_filter(&project, workflow.as_deref()),
            },
            0,
        ),
        CliCommand::Attempts { workflow } => (
            Command::ShowAttempts {
                filter: workflow_filter(&project, workflow.as_deref()),
            },
            0,
        ),
        CliCommand::Tasks { attempt_id } => (
            Command::ShowTasks {
                attempt_id: *attempt_id,
            },
            0,
        ),
        CliCommand::Log { attempt_id } => (
            Command::ShowLogs {
                attempt_id: *attempt_id,
            },
            0,
        ),
        CliCommand::Sched | CliCommand::Check => {
            anyhow::bail!("not an operator command")
        }
    };
    Ok(command)
}

fn reschedule_command(
    schedule_id: crate::types::ScheduleId,
    target: &RescheduleArgs,
) -> Result<Command> {
    let command = match (target.run_at, target.skip, target.skip_to) {
        (Some(run_at), None, None) => Command::Reschedule {
            schedule_id,
            next_run_time: run_at,
            next_schedule_time: None,
        },
        (None, Some(count), None) => Command::Skip {
            schedule_id,
            target: SkipTarget::Count(count),
        },
        (None, None, Some(to)) => Command::Skip {
            schedule_id,
            target: SkipTarget::To(to),
        },
        _ => anyhow::bail!("exactly one of --run-at, --skip and --skip-to is required"),
    };
    Ok(command)
}

fn workflow_filter(project: &str, workflow: Option<&str>) -> RecordFilter {
    RecordFilter {
        project: Some(project.to_string()),
        workflow: workflow.map(str::to_string),
    }
}

/// Print the validated project: workflows, schedules and task trees.
fn print_check(cfg: &ConfigFile) {
    println!("sessionflow check");
    println!("  server.tick_interval = {:?}", cfg.server.tick_interval);
    println!("  server.heartbeat_timeout = {:?}", cfg.server.heartbeat_timeout);
    println!("  server.max_catchup_ticks = {}", cfg.server.max_catchup_ticks);
    println!();

    println!(
        "project {} ({} workflows):",
        cfg.project.name,
        cfg.project.workflows.len()
    );
    for entry in &cfg.project.workflows {
        println!("  - {}", entry.definition.name);
        if let Some(schedule) = &entry.schedule {
            println!(
                "      schedule: {:?} ({}, delay {}s)",
                schedule.recurrence, schedule.timezone, schedule.delay_seconds
            );
        }
        // Validation already built every graph once.
        let Ok(graph) = dag::build(&entry.definition) else {
            continue;
        };
        for node in graph.nodes().iter().skip(1) {
            let depth = node.name.matches('+').count().saturating_sub(1);
            let indent = "  ".repeat(depth + 2);
            match &node.command {
                Some(cmd) => println!("{indent}{}: {cmd}", node.name),
                None => println!("{indent}{}", node.name),
            }
        }
    }

    debug!("check complete (no execution)");
}
