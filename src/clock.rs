// src/clock.rs

use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// Source of "now" for the tick loop and operator actions.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
