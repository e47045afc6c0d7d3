//! Expansion of interval-based index patterns such as `[logs-]YYYY.MM.DD`
//! into the concrete index names covering a time range.

use crate::{
    error::{Result, ServiceError},
    time::TimeRange,
};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const MAX_EXPANDED_INDICES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexInterval {
    #[serde(alias = "Hourly")]
    Hourly,
    #[serde(alias = "Daily")]
    Daily,
    #[serde(alias = "Weekly")]
    Weekly,
    #[serde(alias = "Monthly")]
    Monthly,
    #[serde(alias = "Yearly")]
    Yearly,
}

impl FromStr for IndexInterval {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            other => Err(ServiceError::Config(format!(
                "unknown index interval '{other}'"
            ))),
        }
    }
}

impl IndexInterval {
    fn floor(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let date = instant.date_naive();
        let start = match self {
            IndexInterval::Hourly => {
                return Utc
                    .with_ymd_and_hms(date.year(), date.month(), date.day(), instant.hour(), 0, 0)
                    .single()
                    .unwrap_or(instant);
            }
            IndexInterval::Daily => date,
            IndexInterval::Weekly => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            IndexInterval::Monthly => date.with_day(1).unwrap_or(date),
            IndexInterval::Yearly => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        };
        Utc.from_utc_datetime(&start.and_time(chrono::NaiveTime::MIN))
    }

    fn step(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            IndexInterval::Hourly => instant.checked_add_signed(Duration::hours(1)),
            IndexInterval::Daily => instant.checked_add_signed(Duration::days(1)),
            IndexInterval::Weekly => instant.checked_add_signed(Duration::weeks(1)),
            IndexInterval::Monthly => instant.checked_add_months(Months::new(1)),
            IndexInterval::Yearly => instant.checked_add_months(Months::new(12)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Format(&'static str),
}

/// Index list for one datasource: a plain comma-separated list, or a dated
/// pattern stepped across the query range.
#[derive(Debug, Clone)]
pub struct IndexPattern {
    pattern: String,
    interval: Option<IndexInterval>,
}

impl IndexPattern {
    pub fn new(pattern: impl Into<String>, interval: Option<IndexInterval>) -> Self {
        Self {
            pattern: pattern.into(),
            interval,
        }
    }

    pub fn indices(&self, range: &TimeRange) -> Result<Vec<String>> {
        let Some(interval) = self.interval else {
            return Ok(self
                .pattern
                .split(',')
                .map(str::trim)
                .filter(|index| !index.is_empty())
                .map(str::to_string)
                .collect());
        };

        let segments = parse_segments(&self.pattern)?;
        let mut indices: Vec<String> = Vec::new();
        let mut current = interval.floor(range.start);

        while current <= range.end {
            let name = render(&segments, current);
            if indices.last() != Some(&name) {
                indices.push(name);
            }
            if indices.len() > MAX_EXPANDED_INDICES {
                return Err(ServiceError::InvalidRequest(format!(
                    "index pattern '{}' expands to more than {MAX_EXPANDED_INDICES} indices",
                    self.pattern
                )));
            }
            current = match interval.step(current) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(indices)
    }
}

fn render(segments: &[Segment], instant: DateTime<Utc>) -> String {
    segments
        .iter()
        .map(|segment| match segment {
            Segment::Literal(text) => text.clone(),
            Segment::Format(format) => instant.format(format).to_string(),
        })
        .collect()
}

const TOKENS: &[(&str, &str)] = &[
    ("GGGG", "%G"),
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MM", "%m"),
    ("DD", "%d"),
    ("HH", "%H"),
    ("WW", "%V"),
];

fn parse_segments(pattern: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = pattern;

    while let Some(ch) = rest.chars().next() {
        if ch == '[' {
            let end = rest.find(']').ok_or_else(|| {
                ServiceError::InvalidRequest(format!(
                    "unterminated literal in index pattern '{pattern}'"
                ))
            })?;
            literal.push_str(&rest[1..end]);
            rest = &rest[end + 1..];
            continue;
        }

        if let Some((token, format)) = TOKENS.iter().find(|(token, _)| rest.starts_with(token)) {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Format(*format));
            rest = &rest[token.len()..];
            continue;
        }

        literal.push(ch);
        rest = &rest[ch.len_utf8()..];
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: (i32, u32, u32, u32), end: (i32, u32, u32, u32)) -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(start.0, start.1, start.2, start.3, 0, 0)
                .unwrap(),
            Utc.with_ymd_and_hms(end.0, end.1, end.2, end.3, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn plain_list_is_split_on_commas() {
        let pattern = IndexPattern::new("logs-a, logs-b,", None);
        let indices = pattern
            .indices(&range((2024, 1, 1, 0), (2024, 1, 2, 0)))
            .unwrap();
        assert_eq!(indices, vec!["logs-a", "logs-b"]);
    }

    #[test]
    fn daily_pattern_covers_each_day() {
        let pattern = IndexPattern::new("[logstash-]YYYY.MM.DD", Some(IndexInterval::Daily));
        let indices = pattern
            .indices(&range((2024, 2, 28, 18), (2024, 3, 1, 2)))
            .unwrap();
        assert_eq!(
            indices,
            vec![
                "logstash-2024.02.28",
                "logstash-2024.02.29",
                "logstash-2024.03.01"
            ]
        );
    }

    #[test]
    fn weekly_pattern_uses_iso_weeks() {
        let pattern = IndexPattern::new("[metrics-]GGGG.WW", Some(IndexInterval::Weekly));
        let indices = pattern
            .indices(&range((2024, 12, 28, 0), (2025, 1, 7, 0)))
            .unwrap();
        assert_eq!(
            indices,
            vec!["metrics-2024.52", "metrics-2025.01", "metrics-2025.02"]
        );
    }

    #[test]
    fn monthly_pattern_with_suffix_literal() {
        let pattern = IndexPattern::new("YYYY.MM[-events]", Some(IndexInterval::Monthly));
        let indices = pattern
            .indices(&range((2023, 11, 15, 0), (2024, 1, 3, 0)))
            .unwrap();
        assert_eq!(
            indices,
            vec!["2023.11-events", "2023.12-events", "2024.01-events"]
        );
    }

    #[test]
    fn rejects_unterminated_literal() {
        let pattern = IndexPattern::new("[logs-YYYY", Some(IndexInterval::Daily));
        assert!(pattern
            .indices(&range((2024, 1, 1, 0), (2024, 1, 1, 1)))
            .is_err());
    }
}
