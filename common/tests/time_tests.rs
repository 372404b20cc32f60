use chrono::{TimeZone, Utc};
use freshet_common::time::{
    USECS_PER_SEC, date_round, date_trunc_second, format_interval, parse_interval,
    parse_timestamp,
};

#[test]
fn test_parse_interval_units() {
    assert_eq!(parse_interval("10 seconds").unwrap(), 10 * USECS_PER_SEC);
    assert_eq!(parse_interval("1 minute").unwrap(), 60 * USECS_PER_SEC);
    assert_eq!(
        parse_interval("1 minute 30 seconds").unwrap(),
        90 * USECS_PER_SEC
    );
    assert_eq!(parse_interval("500 ms").unwrap(), 500_000);
    assert_eq!(parse_interval("2 hours").unwrap(), 7200 * USECS_PER_SEC);
    assert_eq!(parse_interval("1 day").unwrap(), 86_400 * USECS_PER_SEC);
    assert_eq!(parse_interval("0.5 seconds").unwrap(), USECS_PER_SEC / 2);
}

#[test]
fn test_parse_interval_rejects_garbage() {
    assert!(parse_interval("").is_err());
    assert!(parse_interval("10").is_err());
    assert!(parse_interval("ten seconds").is_err());
    assert!(parse_interval("1 month").is_err());
}

#[test]
fn test_format_interval_round_trips() {
    for text in ["10 seconds", "1 minute 30 seconds", "2 hours", "1 day"] {
        let us = parse_interval(text).unwrap();
        assert_eq!(parse_interval(&format_interval(us)).unwrap(), us);
    }
}

#[test]
fn test_date_round_buckets() {
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 7).unwrap()
        + chrono::TimeDelta::milliseconds(350);
    let bucketed = date_round(ts, 2 * USECS_PER_SEC);
    assert_eq!(bucketed, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 6).unwrap());
    assert_eq!(
        date_trunc_second(ts),
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 7).unwrap()
    );
}

#[test]
fn test_date_round_is_idempotent() {
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 34, 56).unwrap();
    let step = 5 * USECS_PER_SEC;
    let once = date_round(ts, step);
    assert_eq!(date_round(once, step), once);
}

#[test]
fn test_parse_timestamp_forms() {
    assert!(parse_timestamp("2024-05-01T12:00:00Z").is_ok());
    assert!(parse_timestamp("2024-05-01 12:00:00").is_ok());
    assert!(parse_timestamp("2024-05-01").is_ok());
    assert!(parse_timestamp("not a timestamp").is_err());
}
