use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt::Debug;
use std::sync::Mutex;

pub const USECS_PER_SEC: i64 = 1_000_000;
pub const USECS_PER_MINUTE: i64 = 60 * USECS_PER_SEC;
pub const USECS_PER_HOUR: i64 = 60 * USECS_PER_MINUTE;
pub const USECS_PER_DAY: i64 = 24 * USECS_PER_HOUR;

/// Source of the current instant. The engine reads time through this seam so
/// sliding-window behavior is testable with a manual clock.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock advanced explicitly by tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance_micros(&self, micros: i64) {
        let mut guard = self.now.lock().expect("manual clock poisoned");
        *guard += chrono::TimeDelta::microseconds(micros);
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("manual clock poisoned") = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock poisoned")
    }
}

/// Buckets a timestamp down to a multiple of `step_micros` since the epoch.
pub fn date_round(ts: DateTime<Utc>, step_micros: i64) -> DateTime<Utc> {
    if step_micros <= 0 {
        return ts;
    }
    let micros = ts.timestamp_micros();
    let bucket = micros.div_euclid(step_micros) * step_micros;
    Utc.timestamp_micros(bucket).single().unwrap_or(ts)
}

/// Truncates a timestamp to whole seconds.
pub fn date_trunc_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    date_round(ts, USECS_PER_SEC)
}

/// Parses interval text of the form `N unit [N unit ...]`, e.g.
/// `'10 seconds'` or `'1 minute 30 seconds'`. Month-or-larger units have no
/// fixed width and are rejected.
pub fn parse_interval(text: &str) -> Result<i64> {
    let mut total: i64 = 0;
    let mut saw_term = false;
    let mut tokens = text.split_whitespace().peekable();

    while let Some(tok) = tokens.next() {
        let qty: f64 = tok
            .parse()
            .map_err(|_| anyhow!("invalid interval quantity {tok:?} in {text:?}"))?;
        let unit = tokens
            .next()
            .ok_or_else(|| anyhow!("missing unit after {tok:?} in interval {text:?}"))?;
        let unit_micros = unit_width(unit)
            .ok_or_else(|| anyhow!("unrecognized interval unit {unit:?} in {text:?}"))?;
        total += (qty * unit_micros as f64).round() as i64;
        saw_term = true;
    }

    if !saw_term {
        bail!("empty interval");
    }
    Ok(total)
}

fn unit_width(unit: &str) -> Option<i64> {
    match unit.to_ascii_lowercase().as_str() {
        "us" | "usec" | "usecs" | "microsecond" | "microseconds" => Some(1),
        "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => Some(1_000),
        "s" | "sec" | "secs" | "second" | "seconds" => Some(USECS_PER_SEC),
        "min" | "mins" | "minute" | "minutes" => Some(USECS_PER_MINUTE),
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(USECS_PER_HOUR),
        "d" | "day" | "days" => Some(USECS_PER_DAY),
        "w" | "week" | "weeks" => Some(7 * USECS_PER_DAY),
        _ => None,
    }
}

/// Renders a microsecond interval in the word form `parse_interval` accepts.
pub fn format_interval(micros: i64) -> String {
    if micros == 0 {
        return "0 seconds".to_owned();
    }
    let mut rest = micros;
    let mut parts = Vec::new();
    for (width, name) in [
        (USECS_PER_DAY, "day"),
        (USECS_PER_HOUR, "hour"),
        (USECS_PER_MINUTE, "minute"),
        (USECS_PER_SEC, "second"),
        (1_000, "millisecond"),
        (1, "microsecond"),
    ] {
        let qty = rest / width;
        if qty != 0 {
            let plural = if qty.abs() == 1 { "" } else { "s" };
            parts.push(format!("{qty} {name}{plural}"));
            rest -= qty * width;
        }
    }
    parts.join(" ")
}

/// Parses timestamp text: RFC 3339 first, then the space-separated form.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
        if fmt == "%Y-%m-%d"
            && let Ok(date) = chrono::NaiveDate::parse_from_str(text, fmt)
        {
            return Ok(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight")));
        }
    }
    bail!("invalid timestamp {text:?}")
}
