//! Time utilities: query time ranges and the bucket interval substituted into requests.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const DEFAULT_MAX_DATA_POINTS: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTimeRange")]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(ServiceError::InvalidRequest(
                "time range start must be before end".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn from_millis(start: i64, end: i64) -> Result<Self> {
        Self::new(from_epoch_millis(start)?, from_epoch_millis(end)?)
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn span(&self) -> Duration {
        self.end.signed_duration_since(self.start)
    }
}

#[derive(Debug, Deserialize)]
struct RawTimeRange {
    #[serde(alias = "start")]
    from: RawInstant,
    #[serde(alias = "end")]
    to: RawInstant,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInstant {
    Millis(i64),
    Text(String),
}

impl RawInstant {
    fn resolve(self) -> Result<DateTime<Utc>> {
        match self {
            RawInstant::Millis(ms) => from_epoch_millis(ms),
            RawInstant::Text(text) => match text.trim().parse::<i64>() {
                Ok(ms) => from_epoch_millis(ms),
                Err(_) => parse_datetime(text.trim()),
            },
        }
    }
}

impl TryFrom<RawTimeRange> for TimeRange {
    type Error = ServiceError;

    fn try_from(raw: RawTimeRange) -> Result<Self> {
        TimeRange::new(raw.from.resolve()?, raw.to.resolve()?)
    }
}

pub fn from_epoch_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        ServiceError::InvalidRequest(format!("timestamp {ms} is out of range"))
    })
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    Err(ServiceError::InvalidRequest(format!(
        "invalid time literal '{value}'"
    )))
}

/// Bucket width of a date histogram, kept both as a duration and as the
/// engine-facing text form (`30s`, `5m`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    duration: Duration,
    text: String,
}

impl Interval {
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            text: format_duration(duration),
            duration,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let duration = parse_duration(trimmed).ok_or_else(|| {
            ServiceError::InvalidRequest(format!("unsupported interval '{raw}'"))
        })?;
        Ok(Self {
            duration,
            text: trimmed.to_string(),
        })
    }

    /// Picks a rounded interval that keeps the range under `max_data_points`
    /// buckets, never going below `min_interval`.
    pub fn calculate(range: &TimeRange, max_data_points: Option<i64>, min_interval: &Interval) -> Self {
        let points = max_data_points
            .filter(|points| *points > 0)
            .unwrap_or(DEFAULT_MAX_DATA_POINTS);
        let raw_ms = range.span().num_milliseconds() / points;
        let rounded = Duration::milliseconds(round_interval_millis(raw_ms));

        if rounded < min_interval.duration {
            min_interval.clone()
        } else {
            Self::from_duration(rounded)
        }
    }

    pub fn millis(&self) -> i64 {
        self.duration.num_milliseconds()
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    let split = value
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let amount: i64 = digits.parse().ok()?;

    match suffix.trim() {
        "ms" => Duration::try_milliseconds(amount),
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        "w" => Duration::try_weeks(amount),
        "y" => Duration::try_days(amount.checked_mul(365)?),
        _ => None,
    }
}

fn format_duration(duration: Duration) -> String {
    let ms = duration.num_milliseconds();
    const SECOND: i64 = 1000;
    const MINUTE: i64 = 60 * SECOND;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;
    const WEEK: i64 = 7 * DAY;
    const YEAR: i64 = 365 * DAY;

    if ms >= YEAR && ms % YEAR == 0 {
        format!("{}y", ms / YEAR)
    } else if ms >= WEEK && ms % WEEK == 0 {
        format!("{}w", ms / WEEK)
    } else if ms >= DAY && ms % DAY == 0 {
        format!("{}d", ms / DAY)
    } else if ms >= HOUR && ms % HOUR == 0 {
        format!("{}h", ms / HOUR)
    } else if ms >= MINUTE && ms % MINUTE == 0 {
        format!("{}m", ms / MINUTE)
    } else if ms >= SECOND && ms % SECOND == 0 {
        format!("{}s", ms / SECOND)
    } else {
        format!("{ms}ms")
    }
}

fn round_interval_millis(ms: i64) -> i64 {
    const STEPS: &[(i64, i64)] = &[
        (15, 10),
        (35, 20),
        (75, 50),
        (150, 100),
        (350, 200),
        (750, 500),
        (1_500, 1_000),
        (3_500, 2_000),
        (7_500, 5_000),
        (12_500, 10_000),
        (17_500, 15_000),
        (25_000, 20_000),
        (45_000, 30_000),
        (90_000, 60_000),
        (210_000, 120_000),
        (450_000, 300_000),
        (750_000, 600_000),
        (1_050_000, 900_000),
        (1_500_000, 1_200_000),
        (2_700_000, 1_800_000),
        (5_400_000, 3_600_000),
        (9_000_000, 7_200_000),
        (16_200_000, 10_800_000),
        (32_400_000, 21_600_000),
        (86_400_000, 43_200_000),
        (604_800_000, 86_400_000),
        (1_814_400_000, 604_800_000),
        (3_628_800_000, 2_592_000_000),
    ];

    STEPS
        .iter()
        .find(|(limit, _)| ms <= *limit)
        .map(|(_, rounded)| *rounded)
        .unwrap_or(31_536_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interval_text() {
        let interval = Interval::parse("30s").unwrap();
        assert_eq!(interval.millis(), 30_000);
        assert_eq!(interval.text(), "30s");

        let interval = Interval::parse("250ms").unwrap();
        assert_eq!(interval.millis(), 250);
    }

    #[test]
    fn rejects_unknown_interval_unit() {
        let err = Interval::parse("5 fortnights").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[test]
    fn oversized_interval_is_rejected() {
        for raw in ["9999999999999999d", "9999999999999999w", "9999999999999999999y", "99999999999999999h"] {
            let err = Interval::parse(raw).unwrap_err();
            assert!(matches!(err, ServiceError::InvalidRequest(_)), "{raw}");
        }
    }

    #[test]
    fn calculates_rounded_interval() {
        let range = TimeRange::from_millis(0, 6 * 60 * 60 * 1000).unwrap();
        let min = Interval::parse("10s").unwrap();
        let interval = Interval::calculate(&range, Some(1000), &min);
        assert_eq!(interval.millis(), 20_000);
        assert_eq!(interval.text(), "20s");
    }

    #[test]
    fn calculated_interval_respects_minimum() {
        let range = TimeRange::from_millis(0, 60 * 1000).unwrap();
        let min = Interval::parse("10s").unwrap();
        let interval = Interval::calculate(&range, Some(1000), &min);
        assert_eq!(interval, min);
    }

    #[test]
    fn deserializes_time_range_from_mixed_bounds() {
        let range: TimeRange = serde_json::from_value(serde_json::json!({
            "from": 1_700_000_000_000i64,
            "to": "2023-11-14T22:23:20Z",
        }))
        .unwrap();
        assert_eq!(range.start_millis(), 1_700_000_000_000);
        assert_eq!(range.end_millis(), 1_700_000_600_000);
    }

    #[test]
    fn rejects_inverted_time_range() {
        let err = TimeRange::from_millis(10, 5).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }
}
