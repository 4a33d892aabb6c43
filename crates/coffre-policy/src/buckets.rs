//! UTC bucket keys and retention windows.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

pub(crate) fn cap_or_1(v: u32) -> u32 {
    v.max(1)
}

pub(crate) fn minute_key(t: DateTime<Utc>) -> String {
    format!(
        "{:04}-{:02}-{:02}-{:02}:{:02}",
        t.year(),
        t.month(),
        t.day(),
        t.hour(),
        t.minute()
    )
}

pub(crate) fn hour_key(t: DateTime<Utc>) -> String {
    format!(
        "{:04}-{:02}-{:02}-{:02}",
        t.year(),
        t.month(),
        t.day(),
        t.hour()
    )
}

pub(crate) fn day_key(t: DateTime<Utc>) -> String {
    format!("{:04}-{:02}-{:02}", t.year(), t.month(), t.day())
}

pub(crate) fn iso_week_key(t: DateTime<Utc>) -> String {
    let week = t.iso_week();
    format!("W{:04}-{:02}", week.year(), week.week())
}

pub(crate) fn month_key(t: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", t.year(), t.month())
}

pub(crate) fn year_key(t: DateTime<Utc>) -> String {
    format!("{:04}", t.year())
}

fn start_of_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
        .single()
        .expect("UTC has no ambiguous instants")
}

fn start_of_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
        .single()
        .expect("UTC has no ambiguous instants")
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .expect("UTC has no ambiguous instants")
}

fn start_of_iso_week(t: DateTime<Utc>) -> DateTime<Utc> {
    // Monday is the week start
    let day = start_of_day(t);
    let back = day.weekday().num_days_from_monday();
    day - Duration::days(i64::from(back))
}

fn start_of_month(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .single()
        .expect("UTC has no ambiguous instants")
}

fn start_of_year(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), 1, 1, 0, 0, 0)
        .single()
        .expect("UTC has no ambiguous instants")
}

fn last_n_keys(
    now: DateTime<Utc>,
    n: u32,
    start: fn(DateTime<Utc>) -> DateTime<Utc>,
    prev: fn(DateTime<Utc>) -> DateTime<Utc>,
    key: fn(DateTime<Utc>) -> String,
) -> HashSet<String> {
    let mut keys = HashSet::with_capacity(n as usize);
    let mut cur = start(now);
    for _ in 0..n {
        keys.insert(key(cur));
        cur = prev(cur);
    }
    keys
}

pub(crate) fn last_n_minutes(now: DateTime<Utc>, n: u32) -> HashSet<String> {
    last_n_keys(now, n, start_of_minute, |t| t - Duration::minutes(1), minute_key)
}

pub(crate) fn last_n_hours(now: DateTime<Utc>, n: u32) -> HashSet<String> {
    last_n_keys(now, n, start_of_hour, |t| t - Duration::hours(1), hour_key)
}

pub(crate) fn last_n_days(now: DateTime<Utc>, n: u32) -> HashSet<String> {
    last_n_keys(now, n, start_of_day, |t| t - Duration::days(1), day_key)
}

pub(crate) fn last_n_iso_weeks(now: DateTime<Utc>, n: u32) -> HashSet<String> {
    last_n_keys(
        now,
        n,
        start_of_iso_week,
        |t| t - Duration::days(7),
        iso_week_key,
    )
}

pub(crate) fn last_n_months(now: DateTime<Utc>, n: u32) -> HashSet<String> {
    last_n_keys(
        now,
        n,
        start_of_month,
        // the day before the first of a month lands in the previous month
        |t| start_of_month(t - Duration::days(1)),
        month_key,
    )
}

pub(crate) fn last_n_years(now: DateTime<Utc>, n: u32) -> HashSet<String> {
    last_n_keys(
        now,
        n,
        start_of_year,
        |t| start_of_year(t - Duration::days(1)),
        year_key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_key_formats() {
        let t = ts(2025, 8, 9, 7, 5);
        assert_eq!(minute_key(t), "2025-08-09-07:05");
        assert_eq!(hour_key(t), "2025-08-09-07");
        assert_eq!(day_key(t), "2025-08-09");
        assert_eq!(month_key(t), "2025-08");
        assert_eq!(year_key(t), "2025");
        assert!(iso_week_key(t).starts_with('W'));
    }

    #[test]
    fn test_iso_week_year_boundary() {
        // Monday 2025-12-29 belongs to ISO week 2026-W01; the prior Sunday
        // belongs to 2025-W52.
        assert_eq!(iso_week_key(ts(2025, 12, 29, 10, 0)), "W2026-01");
        assert_eq!(iso_week_key(ts(2025, 12, 28, 10, 0)), "W2025-52");
    }

    #[test]
    fn test_week_starts_monday() {
        let sunday = ts(2025, 8, 24, 23, 59);
        let monday = start_of_iso_week(sunday);
        assert_eq!(day_key(monday), "2025-08-18");
    }

    #[test]
    fn test_last_n_minutes_crosses_hour() {
        let keys = last_n_minutes(ts(2025, 8, 20, 12, 1), 3);
        assert!(keys.contains("2025-08-20-12:01"));
        assert!(keys.contains("2025-08-20-12:00"));
        assert!(keys.contains("2025-08-20-11:59"));
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_last_n_days_crosses_month() {
        let keys = last_n_days(ts(2025, 3, 1, 0, 0), 2);
        assert!(keys.contains("2025-03-01"));
        assert!(keys.contains("2025-02-28"));
    }

    #[test]
    fn test_last_n_months_crosses_year() {
        let keys = last_n_months(ts(2025, 1, 15, 0, 0), 3);
        assert!(keys.contains("2025-01"));
        assert!(keys.contains("2024-12"));
        assert!(keys.contains("2024-11"));
    }

    #[test]
    fn test_last_n_years() {
        let keys = last_n_years(ts(2025, 6, 1, 0, 0), 2);
        assert!(keys.contains("2025"));
        assert!(keys.contains("2024"));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_leap_day_window() {
        let keys = last_n_days(ts(2024, 3, 1, 12, 0), 2);
        assert!(keys.contains("2024-02-29"));
    }

    #[test]
    fn test_cap_coercion() {
        assert_eq!(cap_or_1(0), 1);
        assert_eq!(cap_or_1(1), 1);
        assert_eq!(cap_or_1(7), 7);
    }
}
