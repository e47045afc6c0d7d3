//! Query definitions as authored by the editor: ordered grouping stages plus
//! the computations evaluated inside the innermost stage.

use crate::{
    error::{Result, ServiceError},
    settings::SettingsMap,
    time::{Interval, TimeRange},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    /// Correlation key echoed back with the decoded result.
    #[serde(alias = "refId")]
    pub id: String,
    #[serde(default, rename = "query")]
    pub raw_filter_text: String,
    #[serde(default, rename = "bucketAggs")]
    pub grouping_stages: Vec<GroupingStage>,
    #[serde(default, rename = "metrics")]
    pub computations: Vec<Computation>,
    #[serde(default)]
    pub alias: String,
    /// Interval text as authored; parsed per query by [`QueryDefinition::interval`].
    #[serde(default, deserialize_with = "text_or_none")]
    pub interval: Option<String>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub max_data_points: Option<i64>,
}

/// A node of the combined grouping/computation id space.
#[derive(Debug, Clone, Copy)]
pub enum Definition<'a> {
    Grouping {
        stage: &'a GroupingStage,
        position: usize,
    },
    Computation(&'a Computation),
}

impl QueryDefinition {
    pub fn resolve(&self, id: &str) -> Option<Definition<'_>> {
        if let Some((position, stage)) = self
            .grouping_stages
            .iter()
            .enumerate()
            .find(|(_, stage)| stage.id == id)
        {
            return Some(Definition::Grouping { stage, position });
        }

        self.computation(id).map(Definition::Computation)
    }

    /// The explicit bucket interval, if one was authored.
    pub fn interval(&self) -> Result<Option<Interval>> {
        self.interval
            .as_deref()
            .map(|raw| {
                Interval::parse(raw).map_err(|_| {
                    ServiceError::definition(format!(
                        "query '{}' has unsupported interval '{raw}'",
                        self.id
                    ))
                })
            })
            .transpose()
    }

    pub fn computation(&self, id: &str) -> Option<&Computation> {
        self.computations.iter().find(|metric| metric.id == id)
    }

    /// The date histogram stage, if any. At most one is meaningful per query.
    pub fn date_histogram(&self) -> Option<&GroupingStage> {
        self.grouping_stages
            .iter()
            .find(|stage| matches!(stage.kind, Some(GroupingKind::DateHistogram)))
    }

    /// Raw document queries carry no grouping stages and lead with a raw computation.
    pub fn is_raw_document(&self) -> bool {
        self.grouping_stages.is_empty()
            && self
                .computations
                .first()
                .and_then(|metric| metric.kind.as_ref())
                .is_some_and(ComputationKind::is_raw)
    }

    /// Checks the structural invariants the builder and the walker rely on.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();

        for stage in &self.grouping_stages {
            if stage.id.trim().is_empty() {
                return Err(ServiceError::definition(
                    "grouping stage is missing an id",
                ));
            }
            match &stage.kind {
                None => {
                    return Err(ServiceError::definition(format!(
                        "grouping stage '{}' is missing a type",
                        stage.id
                    )))
                }
                Some(GroupingKind::Other(kind)) => {
                    return Err(ServiceError::definition(format!(
                        "grouping stage '{}' has unsupported type '{kind}'",
                        stage.id
                    )))
                }
                Some(_) => {}
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(ServiceError::definition(format!(
                    "duplicate aggregation id '{}'",
                    stage.id
                )));
            }
        }

        for metric in &self.computations {
            if metric.kind.is_none() {
                return Err(ServiceError::definition(format!(
                    "computation '{}' is missing a type",
                    metric.id
                )));
            }
            if !metric.id.is_empty() && !seen.insert(metric.id.as_str()) {
                return Err(ServiceError::definition(format!(
                    "duplicate aggregation id '{}'",
                    metric.id
                )));
            }
        }

        if self.grouping_stages.is_empty() && !self.is_raw_document() {
            return Err(ServiceError::definition(
                "invalid query, missing metrics and aggregations",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupingStage {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<GroupingKind>,
    #[serde(default)]
    pub field: String,
    #[serde(default, deserialize_with = "settings_or_empty")]
    pub settings: SettingsMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum GroupingKind {
    DateHistogram,
    Histogram,
    Filters,
    Terms,
    GeohashGrid,
    Other(String),
}

impl GroupingKind {
    pub fn keyword(&self) -> &str {
        match self {
            GroupingKind::DateHistogram => "date_histogram",
            GroupingKind::Histogram => "histogram",
            GroupingKind::Filters => "filters",
            GroupingKind::Terms => "terms",
            GroupingKind::GeohashGrid => "geohash_grid",
            GroupingKind::Other(kind) => kind,
        }
    }
}

impl From<String> for GroupingKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "date_histogram" => GroupingKind::DateHistogram,
            "histogram" => GroupingKind::Histogram,
            "filters" => GroupingKind::Filters,
            "terms" => GroupingKind::Terms,
            "geohash_grid" => GroupingKind::GeohashGrid,
            _ => GroupingKind::Other(value),
        }
    }
}

impl From<GroupingKind> for String {
    fn from(kind: GroupingKind) -> Self {
        kind.keyword().to_string()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Computation {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<ComputationKind>,
    #[serde(default)]
    pub field: String,
    #[serde(default, rename = "hide")]
    pub hidden: bool,
    #[serde(default, deserialize_with = "settings_or_empty")]
    pub settings: SettingsMap,
    /// Enabled statistics of an extended-stats computation.
    #[serde(default, deserialize_with = "settings_or_empty")]
    pub meta: SettingsMap,
    /// Named placeholder to referenced computation id, for multi-input pipelines.
    #[serde(
        default,
        rename = "pipelineVariables",
        deserialize_with = "pipeline_references"
    )]
    pub pipeline_references: BTreeMap<String, String>,
}

impl Computation {
    pub fn kind(&self) -> &ComputationKind {
        self.kind.as_ref().unwrap_or(&ComputationKind::Count)
    }

    /// Statistics switched on in `meta`, in name order.
    pub fn enabled_stats(&self) -> Vec<&str> {
        let mut stats: Vec<&str> = self
            .meta
            .iter()
            .filter(|(_, enabled)| enabled.as_bool() == Some(true))
            .map(|(name, _)| name.as_str())
            .collect();
        stats.sort_unstable();
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum ComputationKind {
    Count,
    Avg,
    Sum,
    Max,
    Min,
    Cardinality,
    ExtendedStats,
    Percentiles,
    Rate,
    MovingAvg,
    MovingFn,
    CumulativeSum,
    Derivative,
    SerialDiff,
    BucketScript,
    RawDocument,
    RawData,
    /// Any other single-value metric the engine understands.
    Other(String),
}

impl ComputationKind {
    pub fn keyword(&self) -> &str {
        match self {
            ComputationKind::Count => "count",
            ComputationKind::Avg => "avg",
            ComputationKind::Sum => "sum",
            ComputationKind::Max => "max",
            ComputationKind::Min => "min",
            ComputationKind::Cardinality => "cardinality",
            ComputationKind::ExtendedStats => "extended_stats",
            ComputationKind::Percentiles => "percentiles",
            ComputationKind::Rate => "rate",
            ComputationKind::MovingAvg => "moving_avg",
            ComputationKind::MovingFn => "moving_fn",
            ComputationKind::CumulativeSum => "cumulative_sum",
            ComputationKind::Derivative => "derivative",
            ComputationKind::SerialDiff => "serial_diff",
            ComputationKind::BucketScript => "bucket_script",
            ComputationKind::RawDocument => "raw_document",
            ComputationKind::RawData => "raw_data",
            ComputationKind::Other(kind) => kind,
        }
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(
            self,
            ComputationKind::MovingAvg
                | ComputationKind::MovingFn
                | ComputationKind::CumulativeSum
                | ComputationKind::Derivative
                | ComputationKind::SerialDiff
                | ComputationKind::BucketScript
        )
    }

    /// Pipelines fed by several named inputs rather than a single bucket path.
    pub fn has_multiple_bucket_paths(&self) -> bool {
        matches!(self, ComputationKind::BucketScript)
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, ComputationKind::RawDocument | ComputationKind::RawData)
    }

    pub fn supports_inline_script(&self) -> bool {
        matches!(
            self,
            ComputationKind::Avg
                | ComputationKind::Sum
                | ComputationKind::Max
                | ComputationKind::Min
                | ComputationKind::Cardinality
                | ComputationKind::ExtendedStats
                | ComputationKind::Percentiles
                | ComputationKind::BucketScript
        )
    }

    pub fn display_name(&self) -> String {
        metric_display_name(self.keyword())
    }
}

impl From<String> for ComputationKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "count" => ComputationKind::Count,
            "avg" => ComputationKind::Avg,
            "sum" => ComputationKind::Sum,
            "max" => ComputationKind::Max,
            "min" => ComputationKind::Min,
            "cardinality" => ComputationKind::Cardinality,
            "extended_stats" => ComputationKind::ExtendedStats,
            "percentiles" => ComputationKind::Percentiles,
            "rate" => ComputationKind::Rate,
            "moving_avg" => ComputationKind::MovingAvg,
            "moving_fn" => ComputationKind::MovingFn,
            "cumulative_sum" => ComputationKind::CumulativeSum,
            "derivative" => ComputationKind::Derivative,
            "serial_diff" => ComputationKind::SerialDiff,
            "bucket_script" => ComputationKind::BucketScript,
            "raw_document" => ComputationKind::RawDocument,
            "raw_data" => ComputationKind::RawData,
            _ => ComputationKind::Other(value),
        }
    }
}

impl From<ComputationKind> for String {
    fn from(kind: ComputationKind) -> Self {
        kind.keyword().to_string()
    }
}

impl fmt::Display for ComputationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Human name for a metric keyword or extended statistic; unknown keywords
/// (including percentile labels such as `p95`) are returned unchanged.
pub fn metric_display_name(keyword: &str) -> String {
    let known = match keyword {
        "count" => "Count",
        "avg" => "Average",
        "sum" => "Sum",
        "max" => "Max",
        "min" => "Min",
        "extended_stats" => "Extended Stats",
        "percentiles" => "Percentiles",
        "cardinality" => "Unique Count",
        "moving_avg" => "Moving Average",
        "moving_fn" => "Moving Function",
        "cumulative_sum" => "Cumulative Sum",
        "derivative" => "Derivative",
        "serial_diff" => "Serial Difference",
        "bucket_script" => "Bucket Script",
        "raw_document" => "Raw Document",
        "raw_data" => "Raw Data",
        "rate" => "Rate",
        "std_deviation" => "Std Dev",
        "std_deviation_bounds_upper" => "Std Dev Upper",
        "std_deviation_bounds_lower" => "Std Dev Lower",
        other => return other.to_string(),
    };
    known.to_string()
}

fn settings_or_empty<'de, D>(deserializer: D) -> std::result::Result<SettingsMap, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Object(map)) => map,
        _ => SettingsMap::new(),
    })
}

fn text_or_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) => {
            Some(text.trim().to_string()).filter(|text| !text.is_empty())
        }
        Some(serde_json::Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

#[derive(Deserialize)]
struct PipelineVariable {
    name: String,
    #[serde(rename = "pipelineAgg", default)]
    pipeline_agg: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PipelineVariables {
    Map(BTreeMap<String, String>),
    List(Vec<PipelineVariable>),
}

fn pipeline_references<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        match Option::<PipelineVariables>::deserialize(deserializer)? {
            Some(PipelineVariables::Map(map)) => map,
            Some(PipelineVariables::List(items)) => items
                .into_iter()
                .map(|item| (item.name, item.pipeline_agg))
                .collect(),
            None => BTreeMap::new(),
        },
    )
}
