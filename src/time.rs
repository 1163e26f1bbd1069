use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, SecondsFormat, TimeZone,
    Utc,
};
use chrono_tz::Tz;

use crate::error::{Error, Result};

// 13-digit epoch values; anything shorter is seconds, anything longer is micro/nano.
const MIN_EPOCH_MS: i64 = 1_000_000_000_000;
const MAX_EPOCH_MS: i64 = 9_999_999_999_999;
const GAP_SEARCH_MINUTES: i64 = 180;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z"];

/// A caller-supplied point in time before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimeInput {
    #[default]
    Now,
    Millis(i64),
    Iso(String),
    DateTime(DateTime<Utc>),
}

impl TimeInput {
    /// Interprets command-line text: digits are epoch milliseconds, anything else ISO-8601.
    pub fn from_arg(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("now") {
            return TimeInput::Now;
        }
        let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(value) = trimmed.parse::<i64>() {
                return TimeInput::Millis(value);
            }
        }
        TimeInput::Iso(trimmed.to_string())
    }
}

impl From<i64> for TimeInput {
    fn from(value: i64) -> Self {
        TimeInput::Millis(value)
    }
}

impl From<&str> for TimeInput {
    fn from(value: &str) -> Self {
        TimeInput::Iso(value.to_string())
    }
}

impl From<String> for TimeInput {
    fn from(value: String) -> Self {
        TimeInput::Iso(value)
    }
}

impl From<DateTime<Utc>> for TimeInput {
    fn from(value: DateTime<Utc>) -> Self {
        TimeInput::DateTime(value)
    }
}

/// Converts any accepted time representation to epoch milliseconds.
///
/// Strings without an offset are read in `tz` (UTC when absent). Strings with
/// an explicit offset must agree with `tz` at that instant.
pub fn normalize_time(input: &TimeInput, tz: Option<Tz>) -> Result<i64> {
    match input {
        TimeInput::Now => Ok(Utc::now().timestamp_millis()),
        TimeInput::Millis(value) => validate_millis(*value),
        TimeInput::DateTime(dt) => Ok(dt.timestamp_millis()),
        TimeInput::Iso(raw) => parse_iso(raw, tz),
    }
}

fn validate_millis(value: i64) -> Result<i64> {
    if !(MIN_EPOCH_MS..=MAX_EPOCH_MS).contains(&value) {
        return Err(Error::validation(format!(
            "timestamp not in milliseconds: {value} (expected a 13-digit epoch value)"
        )));
    }
    Ok(value)
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| Error::validation(format!("unknown timezone: {name}")))
}

pub(crate) fn parse_iso(raw: &str, tz: Option<Tz>) -> Result<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("malformed timestamp: empty string"));
    }

    if let Some(dt) = parse_with_offset(trimmed) {
        check_offset(trimmed, &dt, tz)?;
        return Ok(dt.timestamp_millis());
    }

    let naive = parse_naive(trimmed)
        .ok_or_else(|| Error::validation(format!("malformed timestamp: {trimmed}")))?;
    let zone = tz.unwrap_or(Tz::UTC);
    let resolved = resolve_local(&zone, naive)
        .ok_or_else(|| Error::validation(format!("unresolvable local time {trimmed} in {zone}")))?;
    Ok(resolved.timestamp_millis())
}

fn parse_with_offset(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt);
    }
    OFFSET_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(raw, format).ok())
}

fn parse_naive(raw: &str) -> Option<NaiveDateTime> {
    if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
    {
        return Some(naive);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn check_offset(raw: &str, dt: &DateTime<FixedOffset>, tz: Option<Tz>) -> Result<()> {
    let Some(tz) = tz else {
        return Ok(());
    };
    let expected = tz.offset_from_utc_datetime(&dt.naive_utc()).fix();
    if expected != *dt.offset() {
        return Err(Error::validation(format!(
            "mismatched offset: {raw} carries {} but {tz} is {expected} at that instant",
            dt.offset()
        )));
    }
    Ok(())
}

// Ambiguous wall-clock times take the earlier instant; times inside a DST gap
// move forward to the next valid local time.
fn resolve_local<Tz2: TimeZone>(tz: &Tz2, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        chrono::LocalResult::Ambiguous(a, b) => {
            let (a, b) = (a.with_timezone(&Utc), b.with_timezone(&Utc));
            Some(a.min(b))
        }
        chrono::LocalResult::None => find_next_valid_local(tz, naive, GAP_SEARCH_MINUTES),
    }
}

fn find_next_valid_local<Tz2: TimeZone>(
    tz: &Tz2,
    naive: NaiveDateTime,
    max_minutes: i64,
) -> Option<DateTime<Utc>> {
    for minutes in 1..=max_minutes {
        let candidate = naive + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(a, b) => {
                let (a, b) = (a.with_timezone(&Utc), b.with_timezone(&Utc));
                return Some(a.min(b));
            }
            chrono::LocalResult::None => continue,
        }
    }
    None
}

/// RFC 3339 rendering with millisecond precision in `tz` (UTC when absent).
pub fn format_time(ms: i64, tz: Option<Tz>) -> String {
    let Some(dt) = DateTime::<Utc>::from_timestamp_millis(ms) else {
        return ms.to_string();
    };
    match tz {
        Some(tz) => dt
            .with_timezone(&tz)
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        None => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}
