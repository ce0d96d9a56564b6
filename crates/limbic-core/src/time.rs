//! Millisecond clock and UTC formatting without a calendar dependency.

use std::time::{SystemTime, UNIX_EPOCH};

pub const MS_PER_HOUR: f64 = 3_600_000.0;
pub const MS_PER_DAY: i64 = 86_400_000;

/// Current UTC time as Unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Hours between two millisecond timestamps, never negative.
pub fn hours_between(earlier_ms: i64, later_ms: i64) -> f64 {
    ((later_ms - earlier_ms).max(0)) as f64 / MS_PER_HOUR
}

/// Unix milliseconds to ISO-8601 UTC, second precision.
pub fn millis_to_iso8601(ms: i64) -> String {
    let (date, h, m, s) = split(ms);
    format!("{date}T{h:02}:{m:02}:{s:02}Z")
}

/// Unix milliseconds to `YYYY-MM-DD HH:MM`, the form used in recall output.
pub fn millis_to_minute(ms: i64) -> String {
    let (date, h, m, _) = split(ms);
    format!("{date} {h:02}:{m:02}")
}

fn split(ms: i64) -> (String, i64, i64, i64) {
    let secs = ms.div_euclid(1000);
    let days = secs.div_euclid(86_400);
    let time_of_day = secs.rem_euclid(86_400);
    let (y, mo, d) = date_from_days(days);
    (
        format!("{y:04}-{mo:02}-{d:02}"),
        time_of_day / 3600,
        (time_of_day % 3600) / 60,
        time_of_day % 60,
    )
}

/// Days in any run of 400 Gregorian years.
const DAYS_PER_CYCLE: i64 = 146_097;

fn is_leap(year: i64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn month_len(year: i64, month: u32) -> i64 {
    match month {
        2 if is_leap(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Days since the Unix epoch to a proleptic Gregorian `(year, month, day)`.
fn date_from_days(days: i64) -> (i64, u32, u32) {
    let mut year = 1970 + days.div_euclid(DAYS_PER_CYCLE) * 400;
    let mut left = days.rem_euclid(DAYS_PER_CYCLE);
    loop {
        let len = if is_leap(year) { 366 } else { 365 };
        if left < len {
            break;
        }
        left -= len;
        year += 1;
    }
    let mut month = 1;
    while left >= month_len(year, month) {
        left -= month_len(year, month);
        month += 1;
    }
    (year, month, left as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch() {
        assert_eq!(millis_to_iso8601(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_known_date() {
        // 2026-02-21T13:45:07Z
        assert_eq!(millis_to_iso8601(1_771_681_507_000), "2026-02-21T13:45:07Z");
        assert_eq!(millis_to_minute(1_771_681_507_999), "2026-02-21 13:45");
    }

    #[test]
    fn test_leap_days_and_pre_epoch() {
        assert_eq!(millis_to_iso8601(1_709_164_800_000), "2024-02-29T00:00:00Z");
        assert_eq!(millis_to_minute(951_913_800_000), "2000-03-01 12:30");
        assert_eq!(millis_to_iso8601(-1_000), "1969-12-31T23:59:59Z");
        assert_eq!(millis_to_iso8601(-2_203_891_200_000), "1900-03-01T00:00:00Z");
    }

    #[test]
    fn test_hours_between() {
        assert_eq!(hours_between(0, 7_200_000), 2.0);
        assert_eq!(hours_between(10, 0), 0.0);
    }

    #[test]
    fn test_now_is_recent() {
        let ts = millis_to_iso8601(now_millis());
        assert!(ts.starts_with("20"), "timestamp should be this century: {ts}");
    }
}
