// src/engine/kill.rs

//! Cancellation of whole attempts.

use tracing::debug;

use super::{lock_run, Engine};
use crate::errors::{FlowError, Result};
use crate::store::AttemptRecord;
use crate::types::AttemptId;

impl Engine {
    /// Request that an attempt stop.
    ///
    /// Tasks not yet dispatched are cancelled right away; running ones are
    /// signalled through the agent pool and the attempt becomes Killed once
    /// every task is terminal. Killing a finished or already killed attempt
    /// is a no-op.
    pub fn kill(&self, attempt_id: AttemptId) -> Result<AttemptRecord> {
        let stored = self
            .store
            .attempt(attempt_id)?
            .ok_or_else(|| FlowError::validation(format!("unknown attempt {attempt_id}")))?;

        let Some(live) = self.live_run(attempt_id)? else {
            debug!(attempt_id = %attempt_id, done = stored.done, "attempt not live; kill ignored");
            return Ok(stored);
        };

        let now = self.clock.now();
        let mut run = lock_run(&live)?;
        let step = run.kill(now);
        self.apply_step(&mut run, step)?;
        Ok(run.attempt().clone())
    }
}
