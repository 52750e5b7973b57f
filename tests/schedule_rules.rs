// tests/schedule_rules.rs

mod common;
use crate::common::{at_hour, daily_at, epoch, hourly};

use chrono::{TimeDelta, TimeZone, Utc};

use sessionflow::errors::FlowError;
use sessionflow::timeline::{parse_clock_offset, RecurrenceSpec, ScheduleSpec};

fn spec(recurrence: RecurrenceSpec) -> ScheduleSpec {
    ScheduleSpec {
        recurrence,
        timezone: "UTC".to_string(),
        delay_seconds: 0,
        skip_on_overtime: false,
    }
}

#[test]
fn hourly_sessions_start_on_the_hour() {
    let rule = hourly().compile().unwrap();

    assert_eq!(rule.first_cursor(epoch()).unwrap(), (epoch(), epoch()));
    let now = epoch() + TimeDelta::minutes(1);
    assert_eq!(rule.first_cursor(now).unwrap(), (at_hour(1), at_hour(1)));
    assert_eq!(rule.cursor_after(at_hour(1)).unwrap(), (at_hour(2), at_hour(2)));
}

#[test]
fn hourly_offset_and_delay_shift_only_the_run_time() {
    let rule = ScheduleSpec {
        recurrence: RecurrenceSpec::Hourly { at_seconds: 15 * 60 },
        delay_seconds: 5 * 60,
        ..hourly()
    }
    .compile()
    .unwrap();

    assert_eq!(rule.run_time_of(at_hour(1)).unwrap(), at_hour(1) + TimeDelta::minutes(20));
    // 01:10 is before the 01:20 run of session 01:00.
    let now = at_hour(1) + TimeDelta::minutes(10);
    assert_eq!(
        rule.first_cursor(now).unwrap(),
        (at_hour(1) + TimeDelta::minutes(20), at_hour(1))
    );
}

#[test]
fn daily_sessions_follow_the_local_day() {
    let rule = daily_at(7 * 3600, "Asia/Tokyo").compile().unwrap();

    // Midnight in Tokyo is 15:00 UTC the day before.
    let session = Utc.with_ymd_and_hms(2024, 1, 1, 15, 0, 0).unwrap();
    let run = Utc.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap();
    assert_eq!(rule.first_cursor(epoch()).unwrap(), (run, session));
    assert_eq!(
        rule.next_session_time(session).unwrap(),
        session + TimeDelta::days(1)
    );
}

#[test]
fn cron_accepts_five_field_expressions() {
    let rule = spec(RecurrenceSpec::Cron {
        expr: "30 * * * *".to_string(),
    })
    .compile()
    .unwrap();

    let first = epoch() + TimeDelta::minutes(30);
    assert_eq!(rule.session_time_at_or_after(epoch()).unwrap(), first);
    assert_eq!(rule.session_time_at_or_after(first).unwrap(), first);
    assert_eq!(rule.next_session_time(first).unwrap(), first + TimeDelta::hours(1));
}

#[test]
fn interval_sessions_are_aligned_to_the_step() {
    let rule = spec(RecurrenceSpec::Interval { seconds: 900 })
        .compile()
        .unwrap();

    let t = epoch() + TimeDelta::seconds(100);
    assert_eq!(
        rule.session_time_at_or_after(t).unwrap(),
        epoch() + TimeDelta::minutes(15)
    );
    assert_eq!(rule.session_time_at_or_after(epoch()).unwrap(), epoch());
}

#[test]
fn session_times_between_is_half_open() {
    let rule = hourly().compile().unwrap();
    let times = rule.session_times_between(epoch(), at_hour(3)).unwrap();
    assert_eq!(times, vec![epoch(), at_hour(1), at_hour(2)]);

    let mid = epoch() + TimeDelta::minutes(30);
    let times = rule.session_times_between(mid, at_hour(3)).unwrap();
    assert_eq!(times, vec![at_hour(1), at_hour(2)]);

    assert!(rule.session_times_between(at_hour(3), at_hour(3)).unwrap().is_empty());
}

#[test]
fn hourly_sessions_stay_ascending_across_a_dst_gap() {
    let rule = ScheduleSpec {
        timezone: "America/New_York".to_string(),
        ..hourly()
    }
    .compile()
    .unwrap();

    // 2024-03-10 02:00 local does not exist in New York.
    let from = Utc.with_ymd_and_hms(2024, 3, 10, 5, 0, 0).unwrap();
    let until = Utc.with_ymd_and_hms(2024, 3, 10, 10, 0, 0).unwrap();
    let times = rule.session_times_between(from, until).unwrap();

    assert!(times.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(times.first(), Some(&from));
    assert!(times.len() >= 4);
}

#[test]
fn invalid_rules_are_rejected() {
    let bad = [
        ScheduleSpec {
            timezone: "Mars/Olympus".to_string(),
            ..hourly()
        },
        spec(RecurrenceSpec::Cron {
            expr: "not a cron".to_string(),
        }),
        spec(RecurrenceSpec::Interval { seconds: 0 }),
        spec(RecurrenceSpec::Hourly { at_seconds: 3600 }),
        spec(RecurrenceSpec::Daily { at_seconds: 86_400 }),
    ];
    for s in bad {
        let err = s.compile().unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)), "{s:?} gave {err:?}");
    }
}

#[test]
fn clock_offsets_parse() {
    assert_eq!(parse_clock_offset("07:30:00"), Ok(7 * 3600 + 30 * 60));
    assert_eq!(parse_clock_offset("15:30"), Ok(15 * 60 + 30));
    assert!(parse_clock_offset("7:61:00").is_err());
    assert!(parse_clock_offset("noon").is_err());
}

#[test]
fn oversized_spans_are_rejected_not_panics() {
    let bad = [
        spec(RecurrenceSpec::Interval {
            seconds: 10_000_000_000_000_000,
        }),
        spec(RecurrenceSpec::Interval { seconds: u64::MAX }),
        ScheduleSpec {
            delay_seconds: 8_640_000_000_000,
            ..hourly()
        },
    ];
    for s in bad {
        let err = s.compile().unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)), "{s:?} gave {err:?}");
    }

    assert!(parse_clock_offset("9999999:00:00").is_err());
    assert!(parse_clock_offset("99999999:00").is_err());
}

#[test]
fn cursor_math_at_the_end_of_time_is_an_error() {
    let end = chrono::DateTime::<Utc>::MAX_UTC;
    let start = chrono::DateTime::<Utc>::MIN_UTC;

    let every_hour = spec(RecurrenceSpec::Interval { seconds: 3600 }).compile().unwrap();
    assert!(every_hour.next_session_time(end).is_err());
    assert!(hourly().compile().unwrap().next_session_time(end).is_err());
    assert!(daily_at(0, "UTC").compile().unwrap().cursor_after(end).is_err());

    let delayed = ScheduleSpec {
        delay_seconds: 300,
        ..hourly()
    }
    .compile()
    .unwrap();
    assert!(delayed.first_cursor(start).is_err());
    assert!(delayed.run_time_of(end).is_err());
}
