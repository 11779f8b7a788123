// One-shot schedule expressions
//
// The scheduler service expresses a single fire time as `at(yyyy-mm-ddThh:mm:ss)`
// in local wall-clock time plus a separate IANA timezone. This module renders
// that form for outgoing requests and resolves it back into an absolute
// instant for incoming notifications, together with the retention expiry
// derived from it.

use crate::errors::ScheduleError;
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use regex::Regex;
use std::str::FromStr;

/// How long a record is retained after its execution time (or after it was
/// processed, when no execution time is known)
pub const RETENTION_DAYS: i64 = 30;

const LOCAL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

lazy_static! {
    static ref AT_EXPRESSION: Regex =
        Regex::new(r"^\s*at\(\s*([^)]+?)\s*\)\s*$").expect("at() expression regex is valid");
}

/// Render the `at(...)` expression for a local fire time, truncated to seconds
pub fn at_expression(fire_time: &NaiveDateTime) -> String {
    format!("at({})", fire_time.format(LOCAL_DATETIME_FORMAT))
}

/// Extract the local datetime from an `at(...)` expression
pub fn parse_at_expression(expression: &str) -> Result<NaiveDateTime, ScheduleError> {
    let captures =
        AT_EXPRESSION
            .captures(expression)
            .ok_or_else(|| ScheduleError::InvalidExpression {
                expression: expression.to_string(),
                reason: "expected at(<local-datetime>)".to_string(),
            })?;

    NaiveDateTime::parse_from_str(&captures[1], LOCAL_DATETIME_FORMAT).map_err(|e| {
        ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Parse an IANA timezone name; an absent timezone means UTC
pub fn parse_timezone(timezone: Option<&str>) -> Result<Tz, ScheduleError> {
    match timezone.map(str::trim) {
        None | Some("") => Ok(Tz::UTC),
        Some(name) => Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string())),
    }
}

/// Resolve a local wall-clock time in `timezone` into an absolute instant.
///
/// Ambiguous times (clocks turned back) resolve to the earliest instant;
/// times inside a DST gap do not exist and are rejected.
pub fn resolve_local_time(local: &NaiveDateTime, timezone: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    match timezone.from_local_datetime(local) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(ScheduleError::NonexistentLocalTime {
            local: local.format(LOCAL_DATETIME_FORMAT).to_string(),
            timezone: timezone.name().to_string(),
        }),
    }
}

/// Resolve a notification's schedule expression and timezone into the
/// normalized execution instant
pub fn resolve_execution_time(
    expression: &str,
    timezone: Option<&str>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let local = parse_at_expression(expression)?;
    let tz = parse_timezone(timezone)?;
    resolve_local_time(&local, tz)
}

/// Retention marker in epoch seconds
pub fn expires_at(execution_time: Option<DateTime<Utc>>, processed_at: DateTime<Utc>) -> i64 {
    let base = execution_time.unwrap_or(processed_at);
    (base + Duration::days(RETENTION_DAYS)).timestamp()
}

/// ISO-8601 UTC rendering used when execution times are persisted
pub fn format_utc(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_at_expression_renders_second_precision() {
        let fire = local(2025, 6, 1, 8, 0, 5) + Duration::milliseconds(750);
        assert_eq!(at_expression(&fire), "at(2025-06-01T08:00:05)");
    }

    #[test]
    fn test_parse_at_expression() {
        assert_eq!(
            parse_at_expression("at(2025-06-01T08:00:05)").unwrap(),
            local(2025, 6, 1, 8, 0, 5)
        );
        assert_eq!(
            parse_at_expression("  at( 2025-06-01T08:00:05 ) ").unwrap(),
            local(2025, 6, 1, 8, 0, 5)
        );
    }

    #[test]
    fn test_parse_rejects_other_expression_forms() {
        assert!(parse_at_expression("rate(5 minutes)").is_err());
        assert!(parse_at_expression("cron(0 12 * * ? *)").is_err());
        assert!(parse_at_expression("at(tomorrow)").is_err());
        assert!(parse_at_expression("at()").is_err());
    }

    #[test]
    fn test_resolve_execution_time_with_timezone() {
        let resolved =
            resolve_execution_time("at(2025-01-15T09:00:00)", Some("Asia/Ho_Chi_Minh")).unwrap();
        assert_eq!(format_utc(&resolved), "2025-01-15T02:00:00Z");
    }

    #[test]
    fn test_resolve_execution_time_defaults_to_utc() {
        let resolved = resolve_execution_time("at(2025-01-15T09:00:00)", None).unwrap();
        assert_eq!(format_utc(&resolved), "2025-01-15T09:00:00Z");
    }

    #[test]
    fn test_unknown_timezone_is_rejected() {
        assert_eq!(
            resolve_execution_time("at(2025-01-15T09:00:00)", Some("Mars/Olympus")),
            Err(ScheduleError::InvalidTimezone("Mars/Olympus".to_string()))
        );
    }

    #[test]
    fn test_dst_gap_is_rejected_and_fold_takes_earliest() {
        // 2025-03-09 02:30 does not exist in New York
        assert!(matches!(
            resolve_execution_time("at(2025-03-09T02:30:00)", Some("America/New_York")),
            Err(ScheduleError::NonexistentLocalTime { .. })
        ));

        // 2025-11-02 01:30 happens twice; EDT (UTC-4) comes first
        let folded =
            resolve_execution_time("at(2025-11-02T01:30:00)", Some("America/New_York")).unwrap();
        assert_eq!(format_utc(&folded), "2025-11-02T05:30:00Z");
    }

    #[test]
    fn test_expires_at_prefers_execution_time() {
        let processed = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let execution = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

        assert_eq!(
            expires_at(Some(execution), processed),
            (execution + Duration::days(30)).timestamp()
        );
        assert_eq!(
            expires_at(None, processed),
            (processed + Duration::days(30)).timestamp()
        );
    }
}
