// src/timeline/rule.rs

//! Recurrence rules and the pure cursor arithmetic built on them.
//!
//! A rule yields *session times* (the logical point on the timeline) and maps
//! each to a *run time* (the instant the tick for it becomes due):
//!
//! - `cron` / `interval`: run time = session time + delay.
//! - `hourly` / `daily`: the session time is the start of the hour/day in the
//!   rule's timezone and the run time is `at` into it, plus delay.
//!
//! Nothing here reads the wall clock.

use std::str::FromStr;

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};

use crate::errors::{FlowError, Result};

/// Serializable recurrence definition, as stored on schedule rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrenceSpec {
    Cron { expr: String },
    Interval { seconds: u64 },
    Hourly { at_seconds: u32 },
    Daily { at_seconds: u32 },
}

/// Serializable schedule definition: recurrence plus timezone and options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub recurrence: RecurrenceSpec,
    pub timezone: String,
    #[serde(default)]
    pub delay_seconds: u64,
    #[serde(default)]
    pub skip_on_overtime: bool,
}

impl ScheduleSpec {
    pub fn compile(&self) -> Result<ScheduleRule> {
        ScheduleRule::compile(self)
    }
}

#[derive(Debug, Clone)]
enum Recurrence {
    Cron(Box<CronSchedule>),
    Interval(TimeDelta),
    Hourly,
    Daily,
}

/// Compiled, ready-to-evaluate schedule rule.
#[derive(Debug, Clone)]
pub struct ScheduleRule {
    recurrence: Recurrence,
    tz: Tz,
    /// Offset of the run time into the session's hour/day (`hourly`/`daily`).
    at: TimeDelta,
    delay: TimeDelta,
    skip_on_overtime: bool,
}

/// Longest interval or delay a schedule may use (100 years).
pub const MAX_SCHEDULE_SPAN_SECONDS: u64 = 100 * 366 * 86_400;

/// A bounded schedule span as a `TimeDelta`.
fn schedule_span(what: &str, seconds: u64) -> Result<TimeDelta> {
    if seconds > MAX_SCHEDULE_SPAN_SECONDS {
        return Err(FlowError::validation(format!(
            "schedule {what} of {seconds}s is longer than 100 years"
        )));
    }
    i64::try_from(seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| FlowError::validation(format!("schedule {what} of {seconds}s is out of range")))
}

fn out_of_range(what: &str, t: DateTime<Utc>) -> FlowError {
    FlowError::validation(format!("{what} from {t} is outside the supported time range"))
}

/// Convert a 5-field Unix cron expression to the 6-field (with seconds) form
/// the `cron` crate expects.
fn normalize_cron_expr(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

impl ScheduleRule {
    pub fn compile(spec: &ScheduleSpec) -> Result<Self> {
        let tz: Tz = spec.timezone.parse().map_err(|_| {
            FlowError::validation(format!("invalid timezone '{}'", spec.timezone))
        })?;

        let (recurrence, at) = match &spec.recurrence {
            RecurrenceSpec::Cron { expr } => {
                let schedule = CronSchedule::from_str(&normalize_cron_expr(expr)).map_err(|e| {
                    FlowError::validation(format!("invalid cron expression '{}': {}", expr, e))
                })?;
                (Recurrence::Cron(Box::new(schedule)), TimeDelta::zero())
            }
            RecurrenceSpec::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(FlowError::validation("schedule interval must be > 0"));
                }
                (
                    Recurrence::Interval(schedule_span("interval", *seconds)?),
                    TimeDelta::zero(),
                )
            }
            RecurrenceSpec::Hourly { at_seconds } => {
                if *at_seconds >= 3600 {
                    return Err(FlowError::validation(format!(
                        "hourly offset must be below 60:00 (got {at_seconds}s)"
                    )));
                }
                (Recurrence::Hourly, TimeDelta::seconds(i64::from(*at_seconds)))
            }
            RecurrenceSpec::Daily { at_seconds } => {
                if *at_seconds >= 86_400 {
                    return Err(FlowError::validation(format!(
                        "daily offset must be below 24:00:00 (got {at_seconds}s)"
                    )));
                }
                (Recurrence::Daily, TimeDelta::seconds(i64::from(*at_seconds)))
            }
        };

        Ok(Self {
            recurrence,
            tz,
            at,
            delay: schedule_span("delay", spec.delay_seconds)?,
            skip_on_overtime: spec.skip_on_overtime,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn skip_on_overtime(&self) -> bool {
        self.skip_on_overtime
    }

    /// Instant at which the tick for `session_time` is due.
    pub fn run_time_of(&self, session_time: DateTime<Utc>) -> Result<DateTime<Utc>> {
        session_time
            .checked_add_signed(self.at + self.delay)
            .ok_or_else(|| out_of_range("run time", session_time))
    }

    /// The session time following `prev` on this timeline.
    pub fn next_session_time(&self, prev: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next = match &self.recurrence {
            Recurrence::Cron(schedule) => schedule
                .after(&prev.with_timezone(&self.tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            Recurrence::Interval(step) => prev.checked_add_signed(*step),
            Recurrence::Hourly => prev
                .checked_add_signed(TimeDelta::seconds(1))
                .and_then(|t| self.hour_start_at_or_after(t)),
            Recurrence::Daily => prev
                .checked_add_signed(TimeDelta::seconds(1))
                .and_then(|t| self.day_start_at_or_after(t)),
        };

        next.ok_or_else(|| {
            FlowError::validation(format!("schedule has no session time after {prev}"))
        })
    }

    /// The earliest session time that is `>= t`.
    pub fn session_time_at_or_after(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let found = match &self.recurrence {
            Recurrence::Cron(schedule) => {
                let base = t.with_nanosecond(0).unwrap_or(t);
                let start = if base == t {
                    base.checked_sub_signed(TimeDelta::seconds(1))
                } else {
                    Some(base)
                };
                start.and_then(|start| {
                    schedule
                        .after(&start.with_timezone(&self.tz))
                        .next()
                        .map(|t| t.with_timezone(&Utc))
                })
            }
            Recurrence::Interval(step) => {
                // Interval timelines are aligned to multiples of the step since
                // the unix epoch.
                let secs = step.num_seconds();
                let mut ts = t.timestamp();
                if t.timestamp_subsec_nanos() > 0 {
                    ts += 1;
                }
                (ts + secs - 1)
                    .div_euclid(secs)
                    .checked_mul(secs)
                    .and_then(|aligned| DateTime::from_timestamp(aligned, 0))
            }
            Recurrence::Hourly => self.hour_start_at_or_after(t),
            Recurrence::Daily => self.day_start_at_or_after(t),
        };

        found.ok_or_else(|| FlowError::validation(format!("schedule has no session time at or after {t}")))
    }

    /// Cursor for a newly declared schedule: the earliest session whose run
    /// time is `>= now`.
    pub fn first_cursor(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let earliest = now
            .checked_sub_signed(self.at + self.delay)
            .ok_or_else(|| out_of_range("first session", now))?;
        let session_time = self.session_time_at_or_after(earliest)?;
        Ok((self.run_time_of(session_time)?, session_time))
    }

    /// Cursor that follows the session at `session_time`.
    pub fn cursor_after(
        &self,
        session_time: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let next = self.next_session_time(session_time)?;
        Ok((self.run_time_of(next)?, next))
    }

    /// All session times in `[from, until)`, strictly ascending.
    pub fn session_times_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let mut out = Vec::new();
        let mut t = self.session_time_at_or_after(from)?;
        while t < until {
            out.push(t);
            t = self.next_session_time(t)?;
        }
        Ok(out)
    }

    fn hour_start_at_or_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = t.with_timezone(&self.tz).naive_local();
        let start = local.date().and_hms_opt(local.hour(), 0, 0)?;
        let start = self.resolve_local(start)?;
        if start >= t {
            Some(start)
        } else {
            self.resolve_local(
                local
                    .date()
                    .and_hms_opt(local.hour(), 0, 0)?
                    .checked_add_signed(TimeDelta::hours(1))?,
            )
        }
    }

    fn day_start_at_or_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_date = t.with_timezone(&self.tz).date_naive();
        let start = self.resolve_local(local_date.and_hms_opt(0, 0, 0)?)?;
        if start >= t {
            Some(start)
        } else {
            let next_date = local_date.succ_opt()?;
            self.resolve_local(next_date.and_hms_opt(0, 0, 0)?)
        }
    }

    /// Map a local wall-clock time to UTC. Ambiguous times take the earlier
    /// instant; times inside a DST gap move forward by an hour.
    fn resolve_local(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => self
                .tz
                .from_local_datetime(&naive.checked_add_signed(TimeDelta::hours(1))?)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Parse `"HH:MM:SS"` (daily) or `"MM:SS"` (hourly) into seconds.
pub fn parse_clock_offset(s: &str) -> std::result::Result<u32, String> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let nums = parts
        .iter()
        .map(|p| p.parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid time '{}': {}", s, e))?;

    let total = match nums.as_slice() {
        [h, m, sec] if *m < 60 && *sec < 60 => h
            .checked_mul(3600)
            .and_then(|t| t.checked_add(m * 60 + sec)),
        [m, sec] if *sec < 60 => m.checked_mul(60).and_then(|t| t.checked_add(*sec)),
        _ => {
            return Err(format!(
                "invalid time '{}' (expected HH:MM:SS or MM:SS)",
                s
            ))
        }
    };
    total.ok_or_else(|| format!("time '{}' is out of range", s))
}
