// src/executor/mod.rs

//! Task graph executor.
//!
//! - [`run`] holds `AttemptRun`, the per-attempt state machine.
//! - [`propagation`] holds readiness / failure / cancellation propagation.
//! - [`step`] defines the result type of one transition.

pub mod propagation;
pub mod run;
pub mod step;

pub use run::{AttemptRun, TaskOutcome};
pub use step::ExecutorStep;
