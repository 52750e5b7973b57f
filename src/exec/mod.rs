// src/exec/mod.rs

//! Process execution layer.
//!
//! This module runs task commands with `tokio::process::Command` and reports
//! back to the runtime via `RuntimeEvent::Agent` events.
//!
//! - [`backend`] provides the `AgentPool` trait and `LocalAgentPool`, the
//!   implementation the scheduler uses in production and which tests replace
//!   with a fake.
//! - [`executor_loop`] owns the loop that tracks running processes.
//! - [`task_runner`] runs one process, captures its log and output params.

pub mod backend;
pub mod executor_loop;
pub mod task_runner;

pub use backend::{
    AgentEvent, AgentPool, DetachedAgentPool, DispatchRequest, LocalAgentPool, LocalAgentSettings,
};
pub use crate::executor::TaskOutcome;
