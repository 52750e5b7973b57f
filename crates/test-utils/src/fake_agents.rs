use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use sessionflow::errors::{FlowError, Result};
use sessionflow::exec::{AgentPool, DispatchRequest};
use sessionflow::types::TaskId;

/// An agent pool that:
/// - records every dispatch and cancel request
/// - never runs anything; the test reports outcomes through the engine
/// - can be told to refuse dispatches, like an unreachable pool.
#[derive(Debug, Default)]
pub struct FakeAgentPool {
    dispatched: Mutex<Vec<DispatchRequest>>,
    cancelled: Mutex<Vec<TaskId>>,
    refuse: AtomicBool,
}

impl FakeAgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_dispatch(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// All dispatches so far, oldest first.
    pub fn dispatched(&self) -> Vec<DispatchRequest> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Qualified task names of all dispatches so far, oldest first.
    pub fn dispatched_names(&self) -> Vec<String> {
        self.dispatched()
            .into_iter()
            .map(|r| r.task_name)
            .collect()
    }

    /// Drain recorded dispatches.
    pub fn take_dispatched(&self) -> Vec<DispatchRequest> {
        std::mem::take(&mut *self.dispatched.lock().unwrap())
    }

    /// Most recent dispatch of a task with this qualified name.
    pub fn last_dispatch_of(&self, task_name: &str) -> Option<DispatchRequest> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.task_name == task_name)
            .cloned()
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl AgentPool for FakeAgentPool {
    fn dispatch(&self, request: DispatchRequest) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(FlowError::infrastructure("fake pool refuses dispatch"));
        }
        self.dispatched.lock().unwrap().push(request);
        Ok(())
    }

    fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.cancelled.lock().unwrap().push(task_id);
        Ok(())
    }
}
