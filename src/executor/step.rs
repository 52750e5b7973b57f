// src/executor/step.rs

//! Result type of one executor transition.

use crate::types::AttemptState;

/// What changed in an attempt as a result of one event.
///
/// Indices refer to the attempt's task arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStep {
    /// Command tasks that are Ready and should be handed to the agent pool.
    pub ready: Vec<usize>,
    /// Running command tasks whose agents should be told to stop.
    pub cancel_requests: Vec<usize>,
    /// Tasks that reached a terminal state in this step.
    pub newly_terminal: Vec<usize>,
    /// Tasks that failed and are now waiting for a retry.
    pub retry_scheduled: Vec<usize>,
    /// Set when the attempt became done in this step.
    pub attempt_finished: Option<AttemptState>,
}

impl ExecutorStep {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
            && self.cancel_requests.is_empty()
            && self.newly_terminal.is_empty()
            && self.retry_scheduled.is_empty()
            && self.attempt_finished.is_none()
    }
}
