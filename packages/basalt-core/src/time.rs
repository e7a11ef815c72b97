//! Intervals, timestamp parsing and granularity bucketing.

use chrono::{Datelike, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BasaltError, Result};

const MILLIS_SECOND: i64 = 1_000;
const MILLIS_MINUTE: i64 = 60 * MILLIS_SECOND;
const MILLIS_HOUR: i64 = 60 * MILLIS_MINUTE;
const MILLIS_DAY: i64 = 24 * MILLIS_HOUR;

/// Parse an RFC 3339 timestamp or a bare date into epoch millis.
pub fn parse_timestamp(s: &str) -> Result<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc().timestamp_millis());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let naive = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| BasaltError::ParseFailure(s.to_string()))?;
        return Ok(naive.and_utc().timestamp_millis());
    }
    Err(BasaltError::ParseFailure(s.to_string()))
}

pub fn format_timestamp(ts: i64) -> String {
    match Utc.timestamp_millis_opt(ts).single() {
        Some(dt) if ts % 1000 == 0 => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        None => ts.to_string(),
    }
}

/// Half-open time span `[start, end)` in epoch millis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    pub fn new(start: i64, end: i64) -> Interval {
        Interval { start, end }
    }

    pub const ETERNITY: Interval = Interval {
        start: i64::MIN,
        end: i64::MAX,
    };

    /// Parse `start/end` or `start/ISO-8601 duration`, e.g. `2020-01-01/P1D`.
    pub fn parse(s: &str) -> Result<Interval> {
        let (left, right) = s
            .split_once('/')
            .ok_or_else(|| BasaltError::ParseFailure(s.to_string()))?;
        let start = parse_timestamp(left)?;
        let end = if right.starts_with('P') {
            add_iso_duration(start, right)?
        } else {
            parse_timestamp(right)?
        };
        Ok(Interval { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn overlap(&self, other: &Interval) -> Option<Interval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(Interval { start, end })
        } else {
            None
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Interval::parse(&s).map_err(D::Error::custom)
    }
}

/// Add an ISO-8601 duration (`PnYnMnWnDTnHnMnS`) to an epoch-millis instant.
/// Year and month components move through the calendar, the rest are fixed
/// millisecond spans.
fn add_iso_duration(start: i64, spec: &str) -> Result<i64> {
    let body = spec
        .strip_prefix('P')
        .ok_or_else(|| BasaltError::ParseFailure(spec.to_string()))?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, t),
        None => (body, ""),
    };

    let mut months = 0i64;
    let mut millis = 0i64;
    for (part, is_time) in [(date_part, false), (time_part, true)] {
        let mut digits = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let n: i64 = digits
                .parse()
                .map_err(|_| BasaltError::ParseFailure(spec.to_string()))?;
            digits.clear();
            match (c, is_time) {
                ('Y', false) => months += 12 * n,
                ('M', false) => months += n,
                ('W', false) => millis += n * 7 * MILLIS_DAY,
                ('D', false) => millis += n * MILLIS_DAY,
                ('H', true) => millis += n * MILLIS_HOUR,
                ('M', true) => millis += n * MILLIS_MINUTE,
                ('S', true) => millis += n * MILLIS_SECOND,
                _ => return Err(BasaltError::ParseFailure(spec.to_string())),
            }
        }
        if !digits.is_empty() {
            return Err(BasaltError::ParseFailure(spec.to_string()));
        }
    }

    let mut ts = start;
    if months != 0 {
        let dt = Utc
            .timestamp_millis_opt(ts)
            .single()
            .ok_or_else(|| BasaltError::ParseFailure(spec.to_string()))?;
        let shifted = if months > 0 {
            dt.checked_add_months(chrono::Months::new(months as u32))
        } else {
            dt.checked_sub_months(chrono::Months::new((-months) as u32))
        }
        .ok_or_else(|| BasaltError::ParseFailure(spec.to_string()))?;
        ts = shifted.timestamp_millis();
    }
    Ok(ts + millis)
}

/// Time bucketing applied at ingestion (rollup key) and at query time
/// (cursor per bucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    All,
    /// Identity: no truncation.
    None,
    Second,
    Minute,
    FiveMinute,
    FifteenMinute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
    /// Fixed period in millis.
    Duration(i64),
}

impl Granularity {
    pub fn parse(s: &str) -> Result<Granularity> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(Granularity::All),
            "NONE" => Ok(Granularity::None),
            "SECOND" => Ok(Granularity::Second),
            "MINUTE" => Ok(Granularity::Minute),
            "FIVE_MINUTE" => Ok(Granularity::FiveMinute),
            "FIFTEEN_MINUTE" => Ok(Granularity::FifteenMinute),
            "HOUR" => Ok(Granularity::Hour),
            "DAY" => Ok(Granularity::Day),
            "WEEK" => Ok(Granularity::Week),
            "MONTH" => Ok(Granularity::Month),
            "QUARTER" => Ok(Granularity::Quarter),
            "YEAR" => Ok(Granularity::Year),
            other => Err(BasaltError::IllegalArgument(format!(
                "unknown granularity: {other}"
            ))),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Granularity::All => "all".into(),
            Granularity::None => "none".into(),
            Granularity::Second => "second".into(),
            Granularity::Minute => "minute".into(),
            Granularity::FiveMinute => "five_minute".into(),
            Granularity::FifteenMinute => "fifteen_minute".into(),
            Granularity::Hour => "hour".into(),
            Granularity::Day => "day".into(),
            Granularity::Week => "week".into(),
            Granularity::Month => "month".into(),
            Granularity::Quarter => "quarter".into(),
            Granularity::Year => "year".into(),
            Granularity::Duration(ms) => format!("duration:{ms}"),
        }
    }

    /// Floor an instant to its bucket start.
    pub fn truncate(&self, ts: i64) -> i64 {
        match self {
            Granularity::All => 0,
            Granularity::None => ts,
            Granularity::Second => floor_to(ts, MILLIS_SECOND),
            Granularity::Minute => floor_to(ts, MILLIS_MINUTE),
            Granularity::FiveMinute => floor_to(ts, 5 * MILLIS_MINUTE),
            Granularity::FifteenMinute => floor_to(ts, 15 * MILLIS_MINUTE),
            Granularity::Hour => floor_to(ts, MILLIS_HOUR),
            Granularity::Day => floor_to(ts, MILLIS_DAY),
            Granularity::Week => {
                // epoch day zero was a Thursday; weeks start Monday
                let day = ts.div_euclid(MILLIS_DAY);
                let since_monday = (day + 3).rem_euclid(7);
                (day - since_monday) * MILLIS_DAY
            }
            Granularity::Month => with_calendar(ts, |y, m| (y, m)),
            Granularity::Quarter => with_calendar(ts, |y, m| (y, ((m - 1) / 3) * 3 + 1)),
            Granularity::Year => with_calendar(ts, |y, _| (y, 1)),
            Granularity::Duration(ms) => floor_to(ts, (*ms).max(1)),
        }
    }

    /// Start of the bucket after `bucket_start`.
    pub fn next(&self, bucket_start: i64) -> i64 {
        match self {
            Granularity::All => i64::MAX,
            Granularity::None => bucket_start + 1,
            Granularity::Second => bucket_start + MILLIS_SECOND,
            Granularity::Minute => bucket_start + MILLIS_MINUTE,
            Granularity::FiveMinute => bucket_start + 5 * MILLIS_MINUTE,
            Granularity::FifteenMinute => bucket_start + 15 * MILLIS_MINUTE,
            Granularity::Hour => bucket_start + MILLIS_HOUR,
            Granularity::Day => bucket_start + MILLIS_DAY,
            Granularity::Week => bucket_start + 7 * MILLIS_DAY,
            Granularity::Month => add_months(bucket_start, 1),
            Granularity::Quarter => add_months(bucket_start, 3),
            Granularity::Year => add_months(bucket_start, 12),
            Granularity::Duration(ms) => bucket_start + (*ms).max(1),
        }
    }

    /// Bucket intervals whose intersection with `interval` is non-empty,
    /// ascending by default. Each returned interval is the full bucket; the
    /// caller intersects with its data range for scanning and uses `start`
    /// as the output timestamp.
    pub fn buckets(&self, interval: Interval, descending: bool) -> Vec<Interval> {
        if interval.is_empty() {
            return Vec::new();
        }
        if matches!(self, Granularity::All) {
            return vec![interval];
        }
        let mut out = Vec::new();
        let mut start = self.truncate(interval.start);
        // guard against pathological duration values
        let mut remaining = 1_000_000u32;
        while start < interval.end && remaining > 0 {
            let end = self.next(start);
            out.push(Interval::new(start, end));
            start = end;
            remaining -= 1;
        }
        if descending {
            out.reverse();
        }
        out
    }
}

fn floor_to(ts: i64, unit: i64) -> i64 {
    ts - ts.rem_euclid(unit)
}

fn with_calendar(ts: i64, f: impl Fn(i32, u32) -> (i32, u32)) -> i64 {
    let dt = match Utc.timestamp_millis_opt(ts).single() {
        Some(dt) => dt,
        None => return ts,
    };
    let (y, m) = f(dt.year(), dt.month());
    Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp_millis())
        .unwrap_or(ts)
}

fn add_months(ts: i64, n: u32) -> i64 {
    Utc.timestamp_millis_opt(ts)
        .single()
        .and_then(|dt| dt.checked_add_months(chrono::Months::new(n)))
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(i64::MAX)
}

impl Serialize for Granularity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for Granularity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        match &v {
            serde_json::Value::String(s) => {
                if let Some(ms) = s.strip_prefix("duration:") {
                    let ms: i64 = ms.parse().map_err(D::Error::custom)?;
                    return Ok(Granularity::Duration(ms));
                }
                Granularity::parse(s).map_err(D::Error::custom)
            }
            serde_json::Value::Object(m) => {
                let ms = m
                    .get("duration")
                    .and_then(|d| d.as_i64())
                    .ok_or_else(|| D::Error::custom("duration granularity needs millis"))?;
                Ok(Granularity::Duration(ms))
            }
            other => Err(D::Error::custom(format!("bad granularity: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_parse_with_duration() {
        let iv = Interval::parse("2020-01-01/P1D").unwrap();
        assert_eq!(iv.end - iv.start, MILLIS_DAY);
        let iv = Interval::parse("2020-01-01T00:00:00Z/2020-01-02T00:00:00Z").unwrap();
        assert_eq!(iv.end - iv.start, MILLIS_DAY);
        let iv = Interval::parse("2020-01-31/P1M").unwrap();
        // calendar month add clamps to Feb 29 (leap year)
        assert_eq!(iv.end, parse_timestamp("2020-02-29").unwrap());
    }

    #[test]
    fn test_minute_buckets() {
        let iv = Interval::parse("2020-01-01/P1D").unwrap();
        let buckets = Granularity::Minute.buckets(Interval::new(iv.start, iv.start + 125_000), false);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].start, iv.start);
        assert_eq!(buckets[1].start, iv.start + MILLIS_MINUTE);
    }

    #[test]
    fn test_week_truncates_to_monday() {
        // 2020-01-01 was a Wednesday
        let ts = parse_timestamp("2020-01-01").unwrap();
        let monday = parse_timestamp("2019-12-30").unwrap();
        assert_eq!(Granularity::Week.truncate(ts), monday);
    }

    #[test]
    fn test_quarter_truncation() {
        let ts = parse_timestamp("2020-05-15").unwrap();
        assert_eq!(
            Granularity::Quarter.truncate(ts),
            parse_timestamp("2020-04-01").unwrap()
        );
    }

    #[test]
    fn test_empty_interval_yields_no_buckets() {
        let iv = Interval::new(10, 10);
        assert!(Granularity::Minute.buckets(iv, false).is_empty());
    }
}
