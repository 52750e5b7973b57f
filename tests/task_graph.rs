// tests/task_graph.rs

mod common;
use crate::common::{chain, epoch, init_tracing, TestEngineBuilder};

use std::collections::BTreeSet;

use proptest::prelude::*;

use sessionflow::dag::{self, TaskDefinition, WorkflowDefinition};
use sessionflow::errors::FlowError;
use sessionflow::executor::{AttemptRun, TaskOutcome};
use sessionflow::store::{AttemptRecord, TaskRecord};
use sessionflow::types::{
    AttemptId, AttemptState, Params, RetryPolicy, SessionId, TaskId, TaskState, WorkflowRef,
};

fn assert_validation(def: &WorkflowDefinition) {
    let err = dag::build(def).unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)), "got {err:?}");
}

#[test]
fn chain_depends_on_previous_sibling() {
    let graph = dag::build(&chain("wf", &["a", "b", "c"])).unwrap();

    let names: Vec<&str> = graph.nodes().iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["+wf", "+wf+a", "+wf+b", "+wf+c"]);
    let b = graph.index_of("+wf+b").unwrap();
    assert_eq!(graph.nodes()[b].deps, vec![graph.index_of("+wf+a").unwrap()]);
    assert!(graph.nodes()[0].command.is_none());
}

#[test]
fn after_resolves_siblings_and_qualified_names() {
    let def = WorkflowDefinition::new(
        "wf",
        vec![
            TaskDefinition::group(
                "prep",
                vec![
                    TaskDefinition::command("x", "echo x"),
                    TaskDefinition::command("y", "echo y"),
                ],
            )
            .parallel(),
            TaskDefinition::group(
                "load",
                vec![
                    TaskDefinition::command("u", "echo u"),
                    TaskDefinition::command("v", "echo v").after("u").after("+wf+prep+x"),
                ],
            )
            .parallel(),
        ],
    )
    .parallel();
    let graph = dag::build(&def).unwrap();

    let v = graph.index_of("+wf+load+v").unwrap();
    let deps: BTreeSet<&str> = graph.nodes()[v]
        .deps
        .iter()
        .map(|&d| graph.nodes()[d].name.as_str())
        .collect();
    assert_eq!(deps, BTreeSet::from(["+wf+load+u", "+wf+prep+x"]));
}

#[test]
fn retry_policy_is_inherited_from_the_nearest_ancestor() {
    let outer = RetryPolicy {
        limit: 3,
        ..RetryPolicy::none()
    };
    let inner = RetryPolicy {
        limit: 1,
        ..RetryPolicy::none()
    };
    let def = WorkflowDefinition::new(
        "wf",
        vec![
            TaskDefinition::command("a", "echo a"),
            TaskDefinition::group("g", vec![TaskDefinition::command("b", "echo b")])
                .with_retry(inner),
        ],
    )
    .with_retry(outer);
    let graph = dag::build(&def).unwrap();

    let a = graph.index_of("+wf+a").unwrap();
    let b = graph.index_of("+wf+g+b").unwrap();
    assert_eq!(graph.nodes()[a].retry.limit, 3);
    assert_eq!(graph.nodes()[b].retry.limit, 1);
}

#[test]
fn cycles_are_rejected() {
    let def = WorkflowDefinition::new(
        "wf",
        vec![
            TaskDefinition::command("a", "echo a").after("b"),
            TaskDefinition::command("b", "echo b"),
        ],
    );
    assert_validation(&def);
}

#[test]
fn cycles_through_a_group_are_rejected() {
    // `a` waits on the group that contains it.
    let def = WorkflowDefinition::new(
        "wf",
        vec![TaskDefinition::group(
            "g",
            vec![TaskDefinition::command("a", "echo a").after("+wf+g")],
        )],
    );
    assert_validation(&def);
}

#[test]
fn malformed_definitions_are_rejected() {
    assert_validation(&WorkflowDefinition::new("wf", vec![]));
    assert_validation(&chain("wf", &["a", "a"]));
    assert_validation(&chain("wf", &["a+b"]));
    assert_validation(&WorkflowDefinition::new(
        "wf",
        vec![TaskDefinition::command("a", "echo a").after("missing")],
    ));
    assert_validation(&WorkflowDefinition::new(
        "wf",
        vec![TaskDefinition::command("a", "echo a").after("a")],
    ));
    assert_validation(&WorkflowDefinition::new(
        "wf",
        vec![TaskDefinition::group("g", vec![])],
    ));
}

#[test]
fn acyclic_workflow_has_a_ready_task_on_start() {
    init_tracing();
    let def = WorkflowDefinition::new(
        "wf",
        vec![
            TaskDefinition::command("a", "echo a").after("b"),
            TaskDefinition::command("b", "echo b"),
        ],
    )
    .parallel();
    let t = TestEngineBuilder::new().with_workflow(def).build();
    t.start("wf", epoch()).unwrap();
    assert_eq!(t.agents.dispatched_names(), vec!["+wf+b"]);
}

// ---- executor properties ----

/// Workflow of `deps.len()` parallel tasks where task `i` waits on the
/// listed earlier tasks.
fn random_workflow(deps: &[Vec<usize>]) -> WorkflowDefinition {
    let tasks = deps
        .iter()
        .enumerate()
        .map(|(i, ds)| {
            let mut task = TaskDefinition::command(format!("t{i}"), format!("echo {i}"));
            for d in ds.iter().collect::<BTreeSet<_>>() {
                task = task.after(format!("t{d}"));
            }
            task
        })
        .collect();
    WorkflowDefinition::new("wf", tasks).parallel()
}

fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n).prop_map(
            |raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, ds)| {
                        if i == 0 {
                            Vec::new()
                        } else {
                            ds.into_iter().map(|d| d % i).collect()
                        }
                    })
                    .collect()
            },
        )
    })
}

fn new_run(def: &WorkflowDefinition) -> AttemptRun {
    let graph = dag::build(def).unwrap();
    let attempt = AttemptRecord {
        id: AttemptId(1),
        session_id: SessionId(1),
        workflow: WorkflowRef::new("proj", &def.name),
        session_time: epoch(),
        retry_attempt_name: None,
        params: Params::new(),
        exported: Params::new(),
        state: AttemptState::Pending,
        done: false,
        kill_requested: false,
        created_at: epoch(),
        finished_at: None,
    };
    let tasks = graph
        .nodes()
        .iter()
        .enumerate()
        .map(|(index, node)| TaskRecord {
            id: TaskId(index as u64 + 100),
            attempt_id: AttemptId(1),
            index,
            name: node.name.clone(),
            parent: node.parent,
            children: node.children.clone(),
            deps: node.deps.clone(),
            command: node.command.clone(),
            params: node.params.clone(),
            retry: node.retry,
            state: TaskState::Blocked,
            retry_count: 0,
            retry_at: None,
            dispatched_at: None,
            last_heartbeat: None,
            error: None,
            outputs: Params::new(),
            started_at: None,
            finished_at: None,
        })
        .collect();
    AttemptRun::new(attempt, tasks).unwrap()
}

proptest! {
    #[test]
    fn every_random_dag_terminates(
        deps in dag_strategy(8),
        failing in proptest::collection::btree_set(0..8usize, 0..3),
    ) {
        let def = random_workflow(&deps);
        let mut run = new_run(&def);
        let now = epoch();

        let mut ready = run.start(now).ready;
        prop_assert!(!ready.is_empty());

        let mut steps = 0;
        while let Some(index) = ready.pop() {
            steps += 1;
            prop_assert!(steps <= 64, "executor did not converge");
            run.mark_dispatched(index, now);
            let task_no: usize = run.task(index).unwrap().name["+wf+t".len()..].parse().unwrap();
            let outcome = if failing.contains(&task_no) {
                TaskOutcome::Error("boom".into())
            } else {
                TaskOutcome::Success(Params::new())
            };
            ready.extend(run.complete(index, outcome, now).ready);
        }

        prop_assert!(run.is_done());
        prop_assert!(run.tasks().iter().all(|t| t.state.is_terminal()));
        let any_failed = run.tasks().iter().any(|t| t.state == TaskState::Error);
        let expected = if any_failed { AttemptState::Error } else { AttemptState::Success };
        prop_assert_eq!(run.attempt().state, expected);
        // A task only succeeds after all of its dependencies did.
        for task in run.tasks() {
            if task.state == TaskState::Success {
                prop_assert!(task.deps.iter().all(|&d| run.tasks()[d].state == TaskState::Success));
            }
        }
    }

    #[test]
    fn kill_always_settles_once_running_tasks_acknowledge(
        deps in dag_strategy(8),
        finished in 0..4usize,
    ) {
        let def = random_workflow(&deps);
        let mut run = new_run(&def);
        let now = epoch();

        let mut ready = run.start(now).ready;
        for _ in 0..finished {
            let Some(index) = ready.pop() else { break };
            run.mark_dispatched(index, now);
            ready.extend(run.complete(index, TaskOutcome::Success(Params::new()), now).ready);
        }
        for &index in &ready {
            run.mark_dispatched(index, now);
        }

        let finished_before_kill = run.is_done();
        let step = run.kill(now);
        for index in step.cancel_requests {
            run.cancel_acknowledged(index, now);
        }

        prop_assert!(run.is_done());
        let expected = if finished_before_kill { AttemptState::Success } else { AttemptState::Killed };
        prop_assert_eq!(run.attempt().state, expected);
        prop_assert!(run.tasks().iter().all(|t| t.state.is_terminal()));
    }
}
