// tests/kill_and_recovery.rs

mod common;
use crate::common::{chain, epoch, init_tracing, TestEngineBuilder};

use std::error::Error;
use std::sync::Arc;

use sessionflow::errors::FlowError;
use sessionflow::exec::AgentEvent;
use sessionflow::fs::MockFileSystem;
use sessionflow::store::{SnapshotStore, Store};
use sessionflow::types::{AttemptId, AttemptState, TaskState};

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn kill_before_dispatch_cancels_everything_at_once() -> TestResult {
    init_tracing();
    let t = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .build();

    t.agents.refuse_dispatch(true);
    let attempt = t.start("wf", epoch())?;
    let killed = t.engine.kill(attempt.id)?;

    assert_eq!(killed.state, AttemptState::Killed);
    assert!(killed.done);
    assert!(killed.kill_requested);
    assert!(t
        .tasks(attempt.id)
        .iter()
        .all(|task| task.state == TaskState::Cancelled));
    assert!(t.agents.cancelled().is_empty());
    assert_eq!(t.engine.live_attempts(), 0);
    Ok(())
}

#[test]
fn kill_waits_for_running_tasks_to_acknowledge() -> TestResult {
    init_tracing();
    let t = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .build();

    let attempt = t.start("wf", epoch())?;
    let a_id = t.task(attempt.id, "+wf+a").id;

    let killing = t.engine.kill(attempt.id)?;
    assert!(!killing.done);
    assert!(killing.kill_requested);
    assert_eq!(t.agents.cancelled(), vec![a_id]);
    assert_eq!(t.task(attempt.id, "+wf+a").state, TaskState::Running);
    assert_eq!(t.task(attempt.id, "+wf+b").state, TaskState::Cancelled);

    // A second kill is a no-op.
    t.engine.kill(attempt.id)?;
    assert_eq!(t.agents.cancelled().len(), 1);

    t.engine
        .handle_agent_event(AgentEvent::CancelAcknowledged { task_id: a_id })?;

    let attempt = t.attempt(attempt.id);
    assert_eq!(attempt.state, AttemptState::Killed);
    assert!(attempt.done);
    assert_eq!(t.task(attempt.id, "+wf+a").state, TaskState::Cancelled);
    Ok(())
}

#[test]
fn completion_racing_a_kill_still_ends_killed() -> TestResult {
    init_tracing();
    let t = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .build();

    let attempt = t.start("wf", epoch())?;
    t.engine.kill(attempt.id)?;
    t.succeed("+wf+a");

    assert_eq!(t.task(attempt.id, "+wf+a").state, TaskState::Success);
    assert_eq!(t.attempt(attempt.id).state, AttemptState::Killed);
    assert_eq!(t.agents.dispatched_names(), vec!["+wf+a"]);
    Ok(())
}

#[test]
fn unsolicited_cancel_acknowledgement_is_ignored() -> TestResult {
    init_tracing();
    let t = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a"]))
        .build();

    let attempt = t.start("wf", epoch())?;
    let a_id = t.task(attempt.id, "+wf+a").id;
    t.engine
        .handle_agent_event(AgentEvent::CancelAcknowledged { task_id: a_id })?;

    assert_eq!(t.task(attempt.id, "+wf+a").state, TaskState::Running);
    assert_eq!(t.attempt(attempt.id).state, AttemptState::Running);
    Ok(())
}

#[test]
fn killing_a_finished_attempt_returns_it_unchanged() -> TestResult {
    init_tracing();
    let t = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a"]))
        .build();

    let attempt = t.start("wf", epoch())?;
    t.succeed("+wf+a");
    let after = t.engine.kill(attempt.id)?;
    assert_eq!(after.state, AttemptState::Success);
    assert!(!after.kill_requested);

    let err = t.engine.kill(AttemptId(9999)).unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)), "got {err:?}");
    Ok(())
}

#[test]
fn recovery_redispatches_running_tasks_without_using_retries() -> TestResult {
    init_tracing();
    let first = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .build();
    let attempt = first.start("wf", epoch())?;
    assert_eq!(first.task(attempt.id, "+wf+a").state, TaskState::Running);

    // A new process over the same store.
    let second = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .with_store(Arc::clone(&first.store))
        .build();
    assert_eq!(second.engine.recover()?, 1);
    assert_eq!(second.agents.dispatched_names(), vec!["+wf+a"]);
    assert_eq!(second.task(attempt.id, "+wf+a").retry_count, 0);

    // Recovering twice does not duplicate the live run.
    assert_eq!(second.engine.recover()?, 0);

    second.succeed("+wf+a");
    second.succeed("+wf+b");
    assert_eq!(second.attempt(attempt.id).state, AttemptState::Success);
    Ok(())
}

#[test]
fn recovery_finishes_a_pending_kill() -> TestResult {
    init_tracing();
    let first = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .build();
    let attempt = first.start("wf", epoch())?;
    first.engine.kill(attempt.id)?;
    assert!(!first.attempt(attempt.id).done);

    let second = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .with_store(Arc::clone(&first.store))
        .build();
    second.engine.recover()?;

    let recovered = second.attempt(attempt.id);
    assert_eq!(recovered.state, AttemptState::Killed);
    assert!(second.agents.dispatched().is_empty());
    Ok(())
}

#[test]
fn snapshot_store_survives_reopen() -> TestResult {
    init_tracing();
    let fs = Arc::new(MockFileSystem::new());
    let store: Arc<dyn Store> = Arc::new(SnapshotStore::open(fs.clone(), "db")?);

    let first = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .with_store(store)
        .build();
    let attempt = first.start("wf", epoch())?;
    first.succeed("+wf+a");

    assert!(fs.paths().iter().any(|p| p.ends_with("state.json")));

    let reopened: Arc<dyn Store> = Arc::new(SnapshotStore::open(fs.clone(), "db")?);
    let stored = reopened.attempt(attempt.id)?.expect("attempt persisted");
    assert_eq!(stored.state, AttemptState::Running);
    let tasks = reopened.tasks_of_attempt(attempt.id)?;
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[1].state, TaskState::Success);
    assert_eq!(tasks[2].state, TaskState::Running);

    let second = TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .with_store(reopened)
        .build();
    second.engine.recover()?;
    second.succeed("+wf+b");
    assert_eq!(second.attempt(attempt.id).state, AttemptState::Success);

    // Ids keep counting after the reload.
    let next = second.start("wf", epoch() + chrono::TimeDelta::hours(1))?;
    assert!(next.id > attempt.id);
    Ok(())
}
