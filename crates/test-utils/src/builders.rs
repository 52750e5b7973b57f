#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sessionflow::dag::{TaskDefinition, WorkflowDefinition};
use sessionflow::engine::{Engine, EngineSettings, ProjectDefinition, WorkflowEntry};
use sessionflow::errors::Result;
use sessionflow::exec::AgentEvent;
use sessionflow::executor::TaskOutcome;
use sessionflow::storage::{MemoryStorage, ObjectStorage};
use sessionflow::store::{MemoryStore, Store, TaskRecord};
use sessionflow::timeline::{RecurrenceSpec, ScheduleSpec};
use sessionflow::types::{AttemptId, Params};

use crate::clock::ManualClock;
use crate::fake_agents::FakeAgentPool;

pub const PROJECT: &str = "proj";

/// `2024-01-01T00:00:00Z`, the default start of the manual clock.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Workflow running `names` one after another, each `echo <name>`.
pub fn chain(workflow: &str, names: &[&str]) -> WorkflowDefinition {
    WorkflowDefinition::new(
        workflow,
        names
            .iter()
            .map(|n| TaskDefinition::command(*n, format!("echo {n}")))
            .collect(),
    )
}

/// Workflow running `names` concurrently.
pub fn fan_out(workflow: &str, names: &[&str]) -> WorkflowDefinition {
    chain(workflow, names).parallel()
}

pub fn hourly() -> ScheduleSpec {
    ScheduleSpec {
        recurrence: RecurrenceSpec::Hourly { at_seconds: 0 },
        timezone: "UTC".to_string(),
        delay_seconds: 0,
        skip_on_overtime: false,
    }
}

pub fn daily_at(at_seconds: u32, timezone: &str) -> ScheduleSpec {
    ScheduleSpec {
        recurrence: RecurrenceSpec::Daily { at_seconds },
        timezone: timezone.to_string(),
        delay_seconds: 0,
        skip_on_overtime: false,
    }
}

/// Builder for an engine wired to in-memory collaborators.
pub struct TestEngineBuilder {
    start: DateTime<Utc>,
    settings: EngineSettings,
    workflows: Vec<WorkflowEntry>,
    store: Option<Arc<dyn Store>>,
}

impl TestEngineBuilder {
    pub fn new() -> Self {
        Self {
            start: epoch(),
            settings: EngineSettings::default(),
            workflows: Vec::new(),
            store: None,
        }
    }

    pub fn at(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_workflow(mut self, definition: WorkflowDefinition) -> Self {
        self.workflows.push(WorkflowEntry {
            definition,
            schedule: None,
        });
        self
    }

    pub fn with_scheduled(mut self, definition: WorkflowDefinition, schedule: ScheduleSpec) -> Self {
        self.workflows.push(WorkflowEntry {
            definition,
            schedule: Some(schedule),
        });
        self
    }

    /// Use an existing store instead of a fresh `MemoryStore`.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn project(&self) -> ProjectDefinition {
        ProjectDefinition {
            name: PROJECT.to_string(),
            workflows: self.workflows.clone(),
        }
    }

    pub fn build(self) -> TestEngine {
        let clock = Arc::new(ManualClock::new(self.start));
        let agents = Arc::new(FakeAgentPool::new());
        let storage: Arc<dyn ObjectStorage> = Arc::new(MemoryStorage::new());
        let store = self
            .store
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let engine = Arc::new(Engine::new(
            Arc::clone(&store),
            agents.clone(),
            Arc::clone(&storage),
            clock.clone(),
            self.settings.clone(),
        ));
        engine
            .apply_project(&self.project())
            .expect("applying test project");

        TestEngine {
            engine,
            agents,
            clock,
            store,
            storage,
        }
    }
}

impl Default for TestEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An engine plus handles on its fake collaborators.
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub agents: Arc<FakeAgentPool>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn Store>,
    pub storage: Arc<dyn ObjectStorage>,
}

impl TestEngine {
    pub fn start(&self, workflow: &str, session_time: DateTime<Utc>) -> Result<sessionflow::store::AttemptRecord> {
        self.engine
            .start(PROJECT, workflow, session_time, Params::new())
    }

    /// Report completion of the latest dispatch of `task_name`.
    pub fn report(&self, task_name: &str, outcome: TaskOutcome) {
        let request = self
            .agents
            .last_dispatch_of(task_name)
            .unwrap_or_else(|| panic!("task {task_name} was never dispatched"));
        self.engine
            .handle_agent_event(AgentEvent::Completed {
                task_id: request.task_id,
                outcome,
            })
            .expect("handling completion");
    }

    pub fn succeed(&self, task_name: &str) {
        self.report(task_name, TaskOutcome::Success(Params::new()));
    }

    pub fn fail(&self, task_name: &str) {
        self.report(task_name, TaskOutcome::Error(format!("{task_name} failed")));
    }

    pub fn tasks(&self, attempt_id: AttemptId) -> Vec<TaskRecord> {
        self.store.tasks_of_attempt(attempt_id).expect("listing tasks")
    }

    /// Stored task row by qualified name.
    pub fn task(&self, attempt_id: AttemptId, name: &str) -> TaskRecord {
        self.tasks(attempt_id)
            .into_iter()
            .find(|t| t.name == name)
            .unwrap_or_else(|| panic!("no task {name} in attempt {attempt_id}"))
    }

    pub fn attempt(&self, attempt_id: AttemptId) -> sessionflow::store::AttemptRecord {
        self.engine.attempt(attempt_id).expect("loading attempt")
    }
}
