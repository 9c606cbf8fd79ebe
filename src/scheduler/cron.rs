//! Pure cron evaluation: parsing, timezone-aware next occurrence, previews.
//!
//! Expressions are stored verbatim. Classic 5-field crontab syntax is
//! normalised here to the 6-field (seconds-first) form the `cron` crate parses.

use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use thiserror::Error;

/// Widest wall-clock shift any zone applies at a transition, plus margin.
const TRANSITION_WINDOW_HOURS: i64 = 3;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid cron expression '{expr}': {reason}")]
pub struct CronError {
    pub expr: String,
    pub reason: String,
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn day_name(raw: &str) -> Option<String> {
    match raw.parse::<usize>() {
        Ok(7) => Some("SUN".to_string()),
        Ok(n) if n < 7 => Some(DAY_NAMES[n].to_string()),
        _ => None,
    }
}

/// Crontab day-of-week numbering (0/7 = Sunday) to names, which the `cron`
/// crate reads unambiguously.
fn normalize_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((b, s)) => (b, Some(s)),
                None => (item, None),
            };
            let mapped = match base.split_once('-') {
                Some(("0", "7")) => "*".to_string(),
                Some((lo, "7")) => match (day_name(lo), step) {
                    (Some(lo), None) => format!("{lo}-SAT,SUN"),
                    (Some(lo), Some(_)) => format!("{lo}-SAT"),
                    (None, _) => base.to_string(),
                },
                Some((lo, hi)) => match (day_name(lo), day_name(hi)) {
                    (Some(lo), Some(hi)) => format!("{lo}-{hi}"),
                    _ => base.to_string(),
                },
                None => day_name(base).unwrap_or_else(|| base.to_string()),
            };
            match step {
                Some(s) => format!("{mapped}/{s}"),
                None => mapped,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Normalise an expression to the seconds-first form.
pub fn normalize(expr: &str) -> Result<String, CronError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            normalize_day_of_week(fields[4])
        )),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(CronError {
            expr: expr.to_string(),
            reason: format!("expected 5, 6 or 7 fields, found {n}"),
        }),
    }
}

pub fn parse(expr: &str) -> Result<CronSchedule, CronError> {
    let normalized = normalize(expr)?;
    CronSchedule::from_str(&normalized).map_err(|e| CronError {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

/// Map a local wall-clock time to an instant.
///
/// An ambiguous time (clocks going back) takes its first occurrence. A time
/// that does not exist (clocks going forward) is read with the offset in force
/// before the gap, so 02:30 on a spring-forward night lands at 03:30.
fn local_to_instant(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(a, b) => Some(a.min(b).with_timezone(&Utc)),
        LocalResult::None => {
            let before = local - Duration::hours(TRANSITION_WINDOW_HOURS);
            let offset = tz.offset_from_local_datetime(&before).earliest()?.fix();
            let utc = local - Duration::seconds(i64::from(offset.local_minus_utc()));
            Some(Utc.from_utc_datetime(&utc))
        }
    }
}

/// The first fire time strictly after `after`, with the cron fields read as
/// wall-clock time in `tz`. `None` when the expression never fires again.
pub fn compute_next_fire(schedule: &CronSchedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local_after = after.with_timezone(&tz).naive_local();
    // Candidates are wall-clock times; iterate them on a UTC-labelled axis.
    let scan_from = Utc.from_utc_datetime(&(local_after - Duration::hours(TRANSITION_WINDOW_HOURS)));
    let window = Duration::hours(TRANSITION_WINDOW_HOURS);

    let mut best: Option<(NaiveDateTime, DateTime<Utc>)> = None;
    for candidate in schedule.after(&scan_from) {
        let local = candidate.naive_utc();
        if let Some((best_local, _)) = best {
            if local > best_local + window {
                break;
            }
        }
        let Some(instant) = local_to_instant(tz, local) else {
            continue;
        };
        if instant <= after {
            continue;
        }
        if best.map_or(true, |(_, b)| instant < b) {
            best = Some((local, instant));
        }
    }
    best.map(|(_, instant)| instant)
}

/// Fire times in `(from, until]`, at most `limit` of them.
pub fn preview(
    schedule: &CronSchedule,
    tz: Tz,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    limit: usize,
) -> Vec<DateTime<Utc>> {
    let mut fires = Vec::new();
    let mut cursor = from;
    while fires.len() < limit {
        match compute_next_fire(schedule, tz, cursor) {
            Some(next) if next <= until => {
                fires.push(next);
                cursor = next;
            }
            _ => break,
        }
    }
    fires
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, tz: &str, after: &str) -> DateTime<Utc> {
        let schedule = parse(expr).unwrap();
        compute_next_fire(&schedule, parse_timezone(tz).unwrap(), utc(after)).unwrap()
    }

    #[test]
    fn test_five_field_is_normalised() {
        assert_eq!(normalize("*/15 * * * *").unwrap(), "0 */15 * * * *");
        assert_eq!(normalize("0 9 * * 1-5").unwrap(), "0 0 9 * * MON-FRI");
        assert_eq!(normalize("0 9 * * 0,6").unwrap(), "0 0 9 * * SUN,SAT");
        assert_eq!(normalize("0 9 * * 5-7").unwrap(), "0 0 9 * * FRI-SAT,SUN");
        assert_eq!(normalize("0 9 * * mon").unwrap(), "0 0 9 * * mon");
        assert_eq!(normalize("0 0 9 * * *").unwrap(), "0 0 9 * * *");
    }

    #[test]
    fn test_invalid_expressions_are_rejected() {
        assert!(parse("not a cron").is_err());
        assert!(parse("* * *").is_err());
        assert!(parse("61 * * * *").is_err());
        let err = parse("* * *").unwrap_err();
        assert!(err.to_string().contains("fields"));
    }

    #[test]
    fn test_weekday_numbering_follows_crontab() {
        // 2025-06-06 is a Friday; crontab 1 = Monday.
        assert_eq!(next("0 9 * * 1", "UTC", "2025-06-06T12:00:00Z"), utc("2025-06-09T09:00:00Z"));
        assert_eq!(next("0 9 * * 0", "UTC", "2025-06-06T12:00:00Z"), utc("2025-06-08T09:00:00Z"));
        assert_eq!(next("0 9 * * 7", "UTC", "2025-06-06T12:00:00Z"), utc("2025-06-08T09:00:00Z"));
    }

    #[test]
    fn test_next_is_strictly_after() {
        assert_eq!(next("0 9 * * *", "UTC", "2025-06-01T09:00:00Z"), utc("2025-06-02T09:00:00Z"));
        assert_eq!(next("0 9 * * *", "UTC", "2025-06-01T08:59:59Z"), utc("2025-06-01T09:00:00Z"));
    }

    #[test]
    fn test_local_time_is_honoured() {
        // 09:00 in Berlin (CEST, UTC+2) in summer.
        assert_eq!(
            next("0 9 * * *", "Europe/Berlin", "2025-07-01T00:00:00Z"),
            utc("2025-07-01T07:00:00Z")
        );
    }

    #[test]
    fn test_spring_forward_keeps_wall_clock() {
        // 2025-03-09: New York jumps from 02:00 EST to 03:00 EDT.
        assert_eq!(
            next("0 9 * * *", "America/New_York", "2025-03-08T14:00:00Z"),
            utc("2025-03-09T13:00:00Z")
        );
    }

    #[test]
    fn test_spring_forward_gap_fires_after_the_jump() {
        // 02:30 does not exist on 2025-03-09; it fires at 03:30 EDT.
        assert_eq!(
            next("30 2 * * *", "America/New_York", "2025-03-08T07:30:00Z"),
            utc("2025-03-09T07:30:00Z")
        );
        assert_eq!(
            next("30 2 * * *", "America/New_York", "2025-03-09T07:30:00Z"),
            utc("2025-03-10T06:30:00Z")
        );
    }

    #[test]
    fn test_hourly_across_spring_forward() {
        assert_eq!(
            next("0 * * * *", "America/New_York", "2025-03-09T06:00:00Z"),
            utc("2025-03-09T07:00:00Z")
        );
        assert_eq!(
            next("0 * * * *", "America/New_York", "2025-03-09T07:00:00Z"),
            utc("2025-03-09T08:00:00Z")
        );
    }

    #[test]
    fn test_fall_back_fires_once() {
        // 2025-11-02: 01:30 happens twice in New York; only the first counts.
        let first = next("30 1 * * *", "America/New_York", "2025-11-01T05:30:00Z");
        assert_eq!(first, utc("2025-11-02T05:30:00Z"));
        let second = next("30 1 * * *", "America/New_York", &first.to_rfc3339());
        assert_eq!(second, utc("2025-11-03T06:30:00Z"));
    }

    #[test]
    fn test_preview_is_bounded() {
        let schedule = parse("0 * * * *").unwrap();
        let from = utc("2025-06-01T00:30:00Z");
        let fires = preview(&schedule, Tz::UTC, from, from + Duration::hours(5), 100);
        assert_eq!(fires.len(), 5);
        assert_eq!(fires[0], utc("2025-06-01T01:00:00Z"));

        let capped = preview(&schedule, Tz::UTC, from, from + Duration::hours(48), 10);
        assert_eq!(capped.len(), 10);
    }

    #[test]
    fn test_timezone_lookup() {
        assert!(parse_timezone("America/New_York").is_some());
        assert!(parse_timezone("UTC").is_some());
        assert!(parse_timezone("Mars/Olympus").is_none());
    }
}
