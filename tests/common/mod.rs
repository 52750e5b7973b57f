#![allow(dead_code)]

pub use sessionflow_test_utils::builders::{
    chain, daily_at, epoch, fan_out, hourly, TestEngine, PROJECT,
};
pub use sessionflow_test_utils::{init_tracing, with_timeout, TestEngineBuilder};

use chrono::{DateTime, TimeDelta, Utc};
use sessionflow::types::WorkflowRef;

pub fn workflow_ref(name: &str) -> WorkflowRef {
    WorkflowRef::new(PROJECT, name)
}

pub fn hours(n: i64) -> TimeDelta {
    TimeDelta::hours(n)
}

/// `epoch() + n hours`.
pub fn at_hour(n: i64) -> DateTime<Utc> {
    epoch() + hours(n)
}
