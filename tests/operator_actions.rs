// tests/operator_actions.rs

mod common;
use crate::common::{at_hour, chain, epoch, hourly, init_tracing, TestEngine, TestEngineBuilder};

use std::error::Error;

use chrono::TimeDelta;
use serde_json::json;

use sessionflow::clock::Clock;
use sessionflow::engine::{Command, CommandOutput, EngineSettings, RetryTarget};
use sessionflow::errors::FlowError;
use sessionflow::executor::TaskOutcome;
use sessionflow::store::{RecordFilter, Store};
use sessionflow::timeline::SkipTarget;
use sessionflow::types::{AttemptId, AttemptState, Params, RetryMode, ScheduleId, SessionId, TaskState};

type TestResult = Result<(), Box<dyn Error>>;

fn unscheduled() -> TestEngine {
    TestEngineBuilder::new()
        .with_workflow(chain("wf", &["a", "b"]))
        .build()
}

/// Hourly `wf` declared with the clock at 05:00, so the cursor starts there.
fn scheduled_at_five() -> (TestEngine, ScheduleId) {
    let t = TestEngineBuilder::new()
        .at(at_hour(5))
        .with_settings(EngineSettings {
            heartbeat_timeout: None,
            ..EngineSettings::default()
        })
        .with_scheduled(chain("wf", &["a"]), hourly())
        .build();
    let id = t.store.schedules().unwrap()[0].id;
    (t, id)
}

fn assert_validation<T: std::fmt::Debug>(result: sessionflow::errors::Result<T>) {
    let err = result.unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)), "got {err:?}");
}

fn assert_conflict<T: std::fmt::Debug>(result: sessionflow::errors::Result<T>) {
    let err = result.unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)), "got {err:?}");
}

// ---- retry ----

#[test]
fn retry_all_reruns_every_task() -> TestResult {
    init_tracing();
    let t = unscheduled();
    let first = t.start("wf", epoch())?;
    t.succeed("+wf+a");
    t.fail("+wf+b");
    assert_eq!(t.attempt(first.id).state, AttemptState::Error);

    let retry = t
        .engine
        .retry(RetryTarget::Attempt(first.id), "again", RetryMode::All, None)?;
    assert_ne!(retry.id, first.id);
    assert_eq!(retry.session_id, first.session_id);
    assert_eq!(retry.retry_attempt_name.as_deref(), Some("again"));
    assert_eq!(t.task(retry.id, "+wf+a").state, TaskState::Running);
    assert_eq!(
        t.agents.dispatched_names(),
        vec!["+wf+a", "+wf+b", "+wf+a"]
    );
    Ok(())
}

#[test]
fn retry_failed_carries_successful_tasks_and_outputs() -> TestResult {
    init_tracing();
    let t = unscheduled();
    let first = t.start("wf", epoch())?;
    let mut outputs = Params::new();
    outputs.insert("rows".into(), json!(10));
    t.report("+wf+a", TaskOutcome::Success(outputs));
    t.fail("+wf+b");

    let retry = t.engine.retry(
        RetryTarget::Session(first.session_id),
        "fix",
        RetryMode::Failed,
        None,
    )?;

    let a = t.task(retry.id, "+wf+a");
    assert_eq!(a.state, TaskState::Success);
    assert_eq!(a.outputs.get("rows"), Some(&json!(10)));
    assert_eq!(retry.exported.get("rows"), Some(&json!(10)));

    let b = t.agents.last_dispatch_of("+wf+b").unwrap();
    assert_eq!(b.attempt_id, retry.id);
    assert_eq!(b.params.get("rows"), Some(&json!(10)));
    assert_eq!(
        t.agents
            .dispatched_names()
            .iter()
            .filter(|n| *n == "+wf+a")
            .count(),
        1
    );

    t.succeed("+wf+b");
    assert_eq!(t.attempt(retry.id).state, AttemptState::Success);
    Ok(())
}

#[test]
fn retry_params_default_to_the_retried_attempt() -> TestResult {
    init_tracing();
    let t = unscheduled();
    let mut params = Params::new();
    params.insert("day".into(), json!("mon"));
    let first = t.engine.start(common::PROJECT, "wf", epoch(), params)?;
    t.fail("+wf+a");

    let same = t
        .engine
        .retry(RetryTarget::Attempt(first.id), "r1", RetryMode::All, None)?;
    assert_eq!(same.params.get("day"), Some(&json!("mon")));
    t.fail("+wf+a");

    let mut other = Params::new();
    other.insert("day".into(), json!("tue"));
    let changed = t
        .engine
        .retry(RetryTarget::Attempt(same.id), "r2", RetryMode::All, Some(other))?;
    assert_eq!(changed.params.get("day"), Some(&json!("tue")));
    Ok(())
}

#[test]
fn retry_of_an_older_attempt_carries_from_that_attempt() -> TestResult {
    init_tracing();
    let t = unscheduled();
    let mut params = Params::new();
    params.insert("day".into(), json!("mon"));
    let first = t.engine.start(common::PROJECT, "wf", epoch(), params)?;
    t.succeed("+wf+a");
    t.fail("+wf+b");

    let mut other = Params::new();
    other.insert("day".into(), json!("tue"));
    let r1 = t
        .engine
        .retry(RetryTarget::Attempt(first.id), "r1", RetryMode::All, Some(other))?;
    t.fail("+wf+a");
    assert!(t.attempt(r1.id).done);

    let r2 = t
        .engine
        .retry(RetryTarget::Attempt(first.id), "r2", RetryMode::Failed, None)?;
    assert_eq!(t.task(r2.id, "+wf+a").state, TaskState::Success);
    assert_eq!(t.task(r2.id, "+wf+b").state, TaskState::Running);
    assert_eq!(r2.params.get("day"), Some(&json!("mon")));
    let b = t.agents.last_dispatch_of("+wf+b").unwrap();
    assert_eq!(b.attempt_id, r2.id);
    Ok(())
}

#[test]
fn retry_of_an_older_attempt_waits_for_the_latest() -> TestResult {
    init_tracing();
    let t = unscheduled();
    let first = t.start("wf", epoch())?;
    t.fail("+wf+a");
    let r1 = t
        .engine
        .retry(RetryTarget::Attempt(first.id), "r1", RetryMode::All, None)?;
    assert!(!t.attempt(r1.id).done);

    assert_conflict(t.engine.retry(RetryTarget::Attempt(first.id), "r2", RetryMode::All, None));
    assert_eq!(t.engine.attempts(&RecordFilter::default())?.len(), 2);
    Ok(())
}

#[test]
fn retry_is_rejected_while_an_attempt_runs() -> TestResult {
    init_tracing();
    let t = unscheduled();
    let first = t.start("wf", epoch())?;

    assert_conflict(t.engine.retry(RetryTarget::Attempt(first.id), "r1", RetryMode::All, None));
    assert_eq!(t.engine.attempts(&RecordFilter::default())?.len(), 1);
    Ok(())
}

#[test]
fn retry_names_are_unique_per_session() -> TestResult {
    init_tracing();
    let t = unscheduled();
    let first = t.start("wf", epoch())?;
    t.fail("+wf+a");

    let r1 = t
        .engine
        .retry(RetryTarget::Attempt(first.id), "r1", RetryMode::All, None)?;
    t.fail("+wf+a");
    assert!(t.attempt(r1.id).done);

    assert_conflict(t.engine.retry(RetryTarget::Attempt(r1.id), "r1", RetryMode::All, None));
    assert_eq!(t.engine.attempts(&RecordFilter::default())?.len(), 2);
    Ok(())
}

#[test]
fn retry_rejects_bad_targets() {
    init_tracing();
    let t = unscheduled();
    assert_validation(t.engine.retry(RetryTarget::Attempt(AttemptId(404)), "r", RetryMode::All, None));
    assert_validation(t.engine.retry(RetryTarget::Session(SessionId(404)), "r", RetryMode::All, None));

    let first = t.start("wf", epoch()).unwrap();
    t.fail("+wf+a");
    assert_validation(t.engine.retry(RetryTarget::Attempt(first.id), " ", RetryMode::All, None));
}

// ---- backfill ----

#[test]
fn backfill_dry_run_matches_the_real_run() -> TestResult {
    init_tracing();
    let (t, id) = scheduled_at_five();

    let planned = t.engine.backfill(id, at_hour(2), "bf", true)?;
    assert_eq!(planned.len(), 3);
    assert!(planned.iter().all(|p| p.id.is_none() && p.session_id.is_none()));
    assert!(t.engine.sessions(&RecordFilter::default())?.is_empty());
    assert!(t.agents.dispatched().is_empty());

    let created = t.engine.backfill(id, at_hour(2), "bf", false)?;
    let planned_times: Vec<_> = planned.iter().map(|p| p.session_time).collect();
    let created_times: Vec<_> = created.iter().map(|c| c.session_time).collect();
    assert_eq!(planned_times, vec![at_hour(2), at_hour(3), at_hour(4)]);
    assert_eq!(created_times, planned_times);
    assert!(created
        .iter()
        .all(|c| c.id.is_some() && c.retry_attempt_name.as_deref() == Some("bf")));
    assert_eq!(t.agents.dispatched().len(), 3);

    // The cursor does not move.
    let schedule = t.engine.schedule(id)?;
    assert_eq!(schedule.next_run_time, at_hour(5));
    Ok(())
}

#[test]
fn backfill_name_conflict_creates_nothing() -> TestResult {
    init_tracing();
    let (t, id) = scheduled_at_five();
    t.engine.backfill(id, at_hour(4), "bf", false)?;
    let attempts = t.engine.attempts(&RecordFilter::default())?.len();

    assert_conflict(t.engine.backfill(id, at_hour(2), "bf", false));
    assert_eq!(t.engine.attempts(&RecordFilter::default())?.len(), attempts);
    assert_eq!(t.engine.sessions(&RecordFilter::default())?.len(), 1);
    Ok(())
}

#[test]
fn backfill_skips_sessions_with_a_running_attempt() -> TestResult {
    init_tracing();
    let (t, id) = scheduled_at_five();
    t.start("wf", at_hour(3))?;

    let created = t.engine.backfill(id, at_hour(2), "bf", false)?;
    let times: Vec<_> = created.iter().map(|c| c.session_time).collect();
    assert_eq!(times, vec![at_hour(2), at_hour(4)]);
    Ok(())
}

#[test]
fn backfill_runs_next_to_a_finished_default_attempt() -> TestResult {
    init_tracing();
    let (t, id) = scheduled_at_five();
    let default = t.start("wf", at_hour(4))?;
    t.succeed("+wf+a");

    let planned = t.engine.backfill(id, at_hour(4), "bf", true)?;
    assert_eq!(planned.len(), 1);
    assert_eq!(planned[0].session_id, Some(default.session_id));

    let created = t.engine.backfill(id, at_hour(4), "bf", false)?;
    assert_eq!(created[0].session_id, Some(default.session_id));
    Ok(())
}

#[test]
fn backfill_rejects_bad_requests() {
    init_tracing();
    let (t, id) = scheduled_at_five();
    assert_validation(t.engine.backfill(id, at_hour(5), "bf", true));
    assert_validation(t.engine.backfill(id, at_hour(6), "bf", true));
    assert_validation(t.engine.backfill(id, at_hour(2), "", true));
    assert_validation(t.engine.backfill(ScheduleId(404), at_hour(2), "bf", true));
}

// ---- reschedule / skip ----

#[test]
fn reschedule_moves_the_cursor_forward_only() -> TestResult {
    init_tracing();
    let (t, id) = scheduled_at_five();

    let moved = t.engine.reschedule(id, at_hour(8), at_hour(8))?;
    assert_eq!(moved.next_run_time, at_hour(8));
    assert_eq!(moved.next_schedule_time, at_hour(8).to_rfc3339());
    assert_eq!(moved.timezone, "UTC");

    assert_validation(t.engine.reschedule(id, at_hour(7), at_hour(7)));
    assert_validation(t.engine.reschedule(id, at_hour(8), at_hour(8)));
    assert_validation(t.engine.reschedule(id, at_hour(9), at_hour(7)));
    assert_validation(t.engine.reschedule(ScheduleId(404), at_hour(9), at_hour(9)));
    assert_eq!(t.engine.schedule(id)?.next_run_time, at_hour(8));

    // Skipped sessions are never created.
    let report = t.engine.tick(at_hour(8))?;
    assert_eq!(report.started.len(), 1);
    let times: Vec<_> = t
        .engine
        .sessions(&RecordFilter::default())?
        .into_iter()
        .map(|s| s.session_time)
        .collect();
    assert_eq!(times, vec![at_hour(8)]);
    Ok(())
}

#[test]
fn skip_by_count_and_to_a_time() -> TestResult {
    init_tracing();
    let (t, id) = scheduled_at_five();

    let skipped = t.engine.skip_schedule(id, SkipTarget::Count(2))?;
    assert_eq!(skipped.next_run_time, at_hour(7));

    let skipped = t
        .engine
        .skip_schedule(id, SkipTarget::To(at_hour(10) + TimeDelta::minutes(30)))?;
    assert_eq!(skipped.next_run_time, at_hour(11));

    assert_validation(t.engine.skip_schedule(id, SkipTarget::Count(0)));
    assert_validation(t.engine.skip_schedule(id, SkipTarget::To(at_hour(3))));
    assert!(t.engine.sessions(&RecordFilter::default())?.is_empty());
    Ok(())
}

#[test]
fn reschedule_command_aligns_the_session_time() -> TestResult {
    init_tracing();
    let (t, id) = scheduled_at_five();
    assert_eq!(
        t.engine
            .aligned_schedule_time(id, at_hour(6) + TimeDelta::minutes(10))?,
        at_hour(7)
    );

    let output = Command::Reschedule {
        schedule_id: id,
        next_run_time: at_hour(9),
        next_schedule_time: None,
    }
    .execute(&t.engine, t.clock.now())?;
    let CommandOutput::Schedule(summary) = output else {
        panic!("expected a schedule, got {output:?}");
    };
    assert_eq!(summary.next_run_time, at_hour(9));
    assert_eq!(summary.next_schedule_time, at_hour(9).to_rfc3339());
    Ok(())
}

#[test]
fn unknown_records_are_not_found_in_queries() {
    init_tracing();
    let t = unscheduled();
    assert!(matches!(t.engine.schedule(ScheduleId(1)), Err(FlowError::NotFound(_))));
    assert!(matches!(t.engine.session(SessionId(1)), Err(FlowError::NotFound(_))));
    assert!(matches!(t.engine.attempt(AttemptId(1)), Err(FlowError::NotFound(_))));
    assert!(matches!(t.engine.tasks(AttemptId(1)), Err(FlowError::NotFound(_))));
}
