//! Decodes the nested bucket tree of one search response into labelled
//! series (date histogram leaves) or table rows (any other leaf).
//!
//! Keys are always sorted before iteration, so identical responses decode to
//! identical output whatever order the engine serialised them in.

use super::pipeline;
use crate::{
    error::{Result, ServiceError},
    models::{
        metric_display_name, Computation, ComputationKind, Definition, GroupingKind,
        GroupingStage, QueryDefinition,
    },
    settings::script_text,
    time::from_epoch_millis,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub type Labels = BTreeMap<String, String>;

pub const METRIC_LABEL: &str = "metric";
pub const FIELD_LABEL: &str = "field";
pub const METRIC_ID_LABEL: &str = "metricId";

const FILTER_LABEL: &str = "filter";
const UNKNOWN_ENGINE_ERROR: &str = "Unknown elasticsearch error response";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// `None` marks a gap: the engine returned no usable number.
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSeries {
    pub name: String,
    pub labels: Labels,
    pub points: Vec<DataPoint>,
}

impl ResultSeries {
    fn new(labels: Labels, points: Vec<DataPoint>) -> Self {
        Self {
            name: String::new(),
            labels,
            points,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TableValue {
    Text(String),
    Number(Option<f64>),
}

impl TableValue {
    fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => TableValue::Number(None),
            Some(Value::String(text)) => TableValue::Text(text.clone()),
            Some(Value::Number(number)) => TableValue::Number(number.as_f64()),
            Some(other) => TableValue::Text(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<TableValue>>,
}

impl Table {
    /// Appends a row, adding columns it introduces; cells missing from a row
    /// stay empty.
    pub fn push_row(&mut self, cells: Vec<(String, TableValue)>) {
        let mut row = vec![TableValue::Number(None); self.columns.len()];
        for (column, value) in cells {
            let index = match self.columns.iter().position(|existing| *existing == column) {
                Some(index) => index,
                None => {
                    self.columns.push(column);
                    for existing in &mut self.rows {
                        existing.push(TableValue::Number(None));
                    }
                    row.push(TableValue::Number(None));
                    self.columns.len() - 1
                }
            };
            row[index] = value;
        }
        self.rows.push(row);
    }

    pub fn extend(&mut self, other: Table) {
        let Table { columns, rows } = other;
        for row in rows {
            self.push_row(columns.iter().cloned().zip(row).collect());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub series: Vec<ResultSeries>,
    pub table: Option<Table>,
}

impl Decoded {
    fn merge(&mut self, other: Decoded) {
        self.series.extend(other.series);
        self.table = match (self.table.take(), other.table) {
            (Some(mut table), Some(more)) => {
                table.extend(more);
                Some(table)
            }
            (table, more) => table.or(more),
        };
    }
}

/// Reason of an engine-reported error: the first root cause, then the
/// top-level reason, then the cause.
pub fn engine_error_reason(error: &Value) -> String {
    let root_cause = error
        .get("root_cause")
        .and_then(Value::as_array)
        .and_then(|causes| causes.first())
        .and_then(|cause| cause.get("reason"))
        .and_then(Value::as_str);
    let reason = error.get("reason").and_then(Value::as_str);
    let caused_by = error
        .get("caused_by")
        .and_then(|cause| cause.get("reason"))
        .and_then(Value::as_str);

    root_cause
        .or(reason)
        .or(caused_by)
        .or_else(|| error.as_str())
        .filter(|reason| !reason.is_empty())
        .unwrap_or(UNKNOWN_ENGINE_ERROR)
        .to_string()
}

/// Numeric value of a response field; `null`, non-numeric text and NaN are gaps.
pub fn cast_to_float(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) if text.trim().eq_ignore_ascii_case("nan") => None,
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|number| !number.is_nan())
}

/// Decodes one entry of a multi-search response for `query`.
pub fn decode_response(query: &QueryDefinition, response: &Value) -> Result<Decoded> {
    if let Some(error) = response.get("error") {
        return Err(ServiceError::Engine(engine_error_reason(error)));
    }

    query.validate()?;

    if query.is_raw_document() {
        return Ok(Decoded {
            series: Vec::new(),
            table: Some(decode_hits(response)?),
        });
    }

    let empty = Map::new();
    let aggregations = match response.get("aggregations") {
        Some(Value::Object(aggregations)) => aggregations,
        None | Some(Value::Null) => &empty,
        Some(_) => return Err(ServiceError::decode("aggregations is not an object")),
    };

    Walker::new(query).walk(aggregations, 0, &Labels::new())
}

fn sorted_keys(map: &Map<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys
}

#[derive(Debug, Clone, Copy)]
struct Bucket<'a> {
    /// Set for buckets keyed by name in a map rather than listed in an array.
    name: Option<&'a str>,
    body: &'a Map<String, Value>,
}

impl<'a> Bucket<'a> {
    fn label_text(&self) -> Result<String> {
        if let Some(name) = self.name {
            return Ok(name.to_string());
        }
        if let Some(Value::String(text)) = self.body.get("key_as_string") {
            return Ok(text.clone());
        }
        match self.body.get("key") {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(Value::Number(number)) => Ok(format_number(number)),
            Some(other) => Err(ServiceError::decode(format!(
                "bucket key {other} is neither a string nor a number"
            ))),
            None => Err(ServiceError::decode("bucket is missing a key")),
        }
    }

    fn key_value(&self) -> Result<TableValue> {
        if let Some(name) = self.name {
            return Ok(TableValue::Text(name.to_string()));
        }
        match self.body.get("key") {
            Some(Value::Number(number)) => Ok(TableValue::Number(number.as_f64())),
            Some(_) | None => self.label_text().map(TableValue::Text),
        }
    }

    fn timestamp(&self) -> Result<DateTime<Utc>> {
        let millis = match (self.name, self.body.get("key")) {
            (Some(name), _) => name.trim().parse::<i64>().ok(),
            (None, Some(Value::Number(number))) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|value| value as i64)),
            (None, _) => None,
        };
        let millis = millis
            .ok_or_else(|| ServiceError::decode("date histogram bucket key is not numeric"))?;
        from_epoch_millis(millis).map_err(|err| ServiceError::decode(err.to_string()))
    }

    fn doc_count(&self) -> Option<f64> {
        self.body.get("doc_count").and_then(cast_to_float)
    }

    fn metric(&self, id: &str) -> Option<&'a Value> {
        self.body.get(id)
    }
}

fn format_number(number: &Number) -> String {
    if let Some(value) = number.as_i64() {
        return value.to_string();
    }
    if let Some(value) = number.as_u64() {
        return value.to_string();
    }
    match number.as_f64() {
        Some(value) if value.fract() == 0.0 && value.abs() < 1e15 => (value as i64).to_string(),
        Some(value) => value.to_string(),
        None => number.to_string(),
    }
}

fn buckets_of<'a>(key: &str, node: &'a Value) -> Result<Vec<Bucket<'a>>> {
    let node = node
        .as_object()
        .ok_or_else(|| ServiceError::decode(format!("aggregation '{key}' is not an object")))?;

    match node.get("buckets") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_object()
                    .map(|body| Bucket { name: None, body })
                    .ok_or_else(|| {
                        ServiceError::decode(format!("bucket of '{key}' is not an object"))
                    })
            })
            .collect(),
        Some(Value::Object(named)) => sorted_keys(named)
            .into_iter()
            .map(|name| match &named[name.as_str()] {
                Value::Object(body) => Ok(Bucket {
                    name: Some(name.as_str()),
                    body,
                }),
                _ => Err(ServiceError::decode(format!(
                    "bucket '{name}' of '{key}' is not an object"
                ))),
            })
            .collect(),
        Some(_) => Err(ServiceError::decode(format!(
            "buckets of '{key}' are neither a list nor a map"
        ))),
    }
}

fn label_name(stage: &GroupingStage, bucket: &Bucket<'_>) -> String {
    if bucket.name.is_some() || matches!(stage.kind, Some(GroupingKind::Filters)) {
        FILTER_LABEL.to_string()
    } else if stage.field.is_empty() {
        stage.id.clone()
    } else {
        stage.field.clone()
    }
}

fn stat_value(metric: Option<&Value>, stat: &str) -> Option<f64> {
    let metric = metric?;
    let value = match stat {
        "std_deviation_bounds_upper" => metric.get("std_deviation_bounds")?.get("upper")?,
        "std_deviation_bounds_lower" => metric.get("std_deviation_bounds")?.get("lower")?,
        other => metric.get(other)?,
    };
    cast_to_float(value)
}

fn single_value(metric: &Value) -> Option<f64> {
    metric
        .get("normalized_value")
        .filter(|value| !value.is_null())
        .or_else(|| metric.get("value"))
        .and_then(cast_to_float)
}

fn percentile_keys(metric: Option<&Value>) -> Vec<String> {
    let mut keys: Vec<String> = metric
        .and_then(|metric| metric.get("values"))
        .and_then(Value::as_object)
        .map(|values| values.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}

struct Walker<'q> {
    query: &'q QueryDefinition,
    leaf_depth: usize,
    computations: Vec<&'q Computation>,
}

impl<'q> Walker<'q> {
    fn new(query: &'q QueryDefinition) -> Self {
        let computations = query
            .computations
            .iter()
            .filter(|metric| !metric.hidden && !metric.kind().is_raw())
            .filter(|metric| {
                !metric.kind().is_pipeline()
                    || pipeline::resolve_bucket_path(metric, &query.computations).is_some()
            })
            .collect();

        Self {
            query,
            leaf_depth: query.grouping_stages.len().saturating_sub(1),
            computations,
        }
    }

    fn walk(&self, aggs: &Map<String, Value>, depth: usize, labels: &Labels) -> Result<Decoded> {
        let mut decoded = Decoded::default();

        for key in sorted_keys(aggs) {
            let (stage, position) = match self.query.resolve(key) {
                Some(Definition::Grouping { stage, position }) => (stage, position),
                Some(Definition::Computation(_)) => continue,
                None => {
                    debug!(key = %key, "skipping response key with no definition");
                    continue;
                }
            };
            if position != depth {
                return Err(ServiceError::decode(format!(
                    "aggregation '{key}' found at depth {depth}, expected depth {position}"
                )));
            }

            let buckets = buckets_of(key, &aggs[key.as_str()])?;

            if depth < self.leaf_depth {
                let next = &self.query.grouping_stages[depth + 1].id;
                for bucket in &buckets {
                    if !bucket.body.contains_key(next.as_str()) {
                        return Err(ServiceError::decode(format!(
                            "bucket of '{key}' is missing nested aggregation '{next}'"
                        )));
                    }
                    let mut branch = labels.clone();
                    branch.insert(label_name(stage, bucket), bucket.label_text()?);
                    decoded.merge(self.walk(bucket.body, depth + 1, &branch)?);
                }
            } else if matches!(stage.kind, Some(GroupingKind::DateHistogram)) {
                decoded.series.extend(self.decode_series(&buckets, labels)?);
            } else {
                decoded.merge(Decoded {
                    series: Vec::new(),
                    table: Some(self.decode_table(stage, &buckets, labels)?),
                });
            }
        }

        Ok(decoded)
    }

    fn decode_series<'b>(
        &self,
        buckets: &[Bucket<'b>],
        labels: &Labels,
    ) -> Result<Vec<ResultSeries>> {
        let timestamps = buckets
            .iter()
            .map(Bucket::timestamp)
            .collect::<Result<Vec<_>>>()?;

        let mut series = Vec::new();
        for metric in &self.computations {
            let id = metric.id.as_str();
            let field = metric.field.as_str();

            match metric.kind() {
                ComputationKind::Count => {
                    let labels = with_labels(labels, [(METRIC_LABEL, "count")]);
                    let points = collect_points(buckets, &timestamps, |bucket| bucket.doc_count());
                    series.push(ResultSeries::new(labels, points));
                }
                ComputationKind::Percentiles => {
                    let Some(first) = buckets.first() else {
                        continue;
                    };
                    for percentile in percentile_keys(first.metric(id)) {
                        let name = format!("p{percentile}");
                        let labels =
                            with_labels(labels, [(METRIC_LABEL, name.as_str()), (FIELD_LABEL, field)]);
                        let points = collect_points(buckets, &timestamps, |bucket| {
                            bucket
                                .metric(id)
                                .and_then(|value| value.get("values"))
                                .and_then(|values| values.get(&percentile))
                                .and_then(cast_to_float)
                        });
                        series.push(ResultSeries::new(labels, points));
                    }
                }
                ComputationKind::ExtendedStats => {
                    for stat in metric.enabled_stats() {
                        let labels = with_labels(labels, [(METRIC_LABEL, stat), (FIELD_LABEL, field)]);
                        let points = collect_points(buckets, &timestamps, |bucket| {
                            stat_value(bucket.metric(id), stat)
                        });
                        series.push(ResultSeries::new(labels, points));
                    }
                }
                kind => {
                    let labels = with_labels(
                        labels,
                        [
                            (METRIC_LABEL, kind.keyword()),
                            (FIELD_LABEL, field),
                            (METRIC_ID_LABEL, id),
                        ],
                    );
                    // Buckets without the metric object carry no point at all.
                    let points = buckets
                        .iter()
                        .zip(&timestamps)
                        .filter_map(|(bucket, timestamp)| {
                            bucket.metric(id).map(|value| DataPoint {
                                timestamp: *timestamp,
                                value: single_value(value),
                            })
                        })
                        .collect();
                    series.push(ResultSeries::new(labels, points));
                }
            }
        }

        Ok(series)
    }

    fn decode_table(
        &self,
        stage: &GroupingStage,
        buckets: &[Bucket<'_>],
        labels: &Labels,
    ) -> Result<Table> {
        let mut table = Table::default();

        for bucket in buckets {
            let mut cells: Vec<(String, TableValue)> = labels
                .iter()
                .map(|(name, value)| (name.clone(), TableValue::Text(value.clone())))
                .collect();
            cells.push((label_name(stage, bucket), bucket.key_value()?));

            for metric in &self.computations {
                let id = metric.id.as_str();
                match metric.kind() {
                    ComputationKind::Count => cells.push((
                        self.column_name(metric, metric_display_name("count")),
                        TableValue::Number(bucket.doc_count()),
                    )),
                    ComputationKind::Percentiles => {
                        for percentile in percentile_keys(bucket.metric(id)) {
                            let value = bucket
                                .metric(id)
                                .and_then(|value| value.get("values"))
                                .and_then(|values| values.get(&percentile))
                                .and_then(cast_to_float);
                            cells.push((
                                self.column_name(metric, format!("p{percentile}")),
                                TableValue::Number(value),
                            ));
                        }
                    }
                    ComputationKind::ExtendedStats => {
                        for stat in metric.enabled_stats() {
                            cells.push((
                                self.column_name(metric, metric_display_name(stat)),
                                TableValue::Number(stat_value(bucket.metric(id), stat)),
                            ));
                        }
                    }
                    kind => cells.push((
                        self.column_name(metric, kind.display_name()),
                        TableValue::Number(bucket.metric(id).and_then(single_value)),
                    )),
                }
            }

            table.push_row(cells);
        }

        Ok(table)
    }

    /// Column title of a computation; computations sharing a kind are told
    /// apart by their field.
    fn column_name(&self, metric: &Computation, base: String) -> String {
        if matches!(metric.kind(), ComputationKind::BucketScript) {
            if let Some(script) = script_text(&metric.settings) {
                return script.to_string();
            }
        }

        let shared = self
            .computations
            .iter()
            .filter(|other| other.kind() == metric.kind())
            .count()
            > 1;
        if shared && !metric.field.is_empty() {
            format!("{base} {}", metric.field)
        } else {
            base
        }
    }
}

fn collect_points<'b>(
    buckets: &[Bucket<'b>],
    timestamps: &[DateTime<Utc>],
    value: impl Fn(&Bucket<'b>) -> Option<f64>,
) -> Vec<DataPoint> {
    buckets
        .iter()
        .zip(timestamps)
        .map(|(bucket, timestamp)| DataPoint {
            timestamp: *timestamp,
            value: value(bucket),
        })
        .collect()
}

fn with_labels<const N: usize>(labels: &Labels, extra: [(&str, &str); N]) -> Labels {
    let mut labels = labels.clone();
    for (name, value) in extra {
        if !value.is_empty() {
            labels.insert(name.to_string(), value.to_string());
        }
    }
    labels
}

/// Table of raw hits: `_id`, `_index`, then every `_source` field by name.
fn decode_hits(response: &Value) -> Result<Table> {
    let hits = match response.get("hits").and_then(|hits| hits.get("hits")) {
        None | Some(Value::Null) => return Ok(Table::default()),
        Some(Value::Array(hits)) => hits,
        Some(_) => return Err(ServiceError::decode("hits is not a list")),
    };

    let fields: BTreeSet<&String> = hits
        .iter()
        .filter_map(|hit| hit.get("_source").and_then(Value::as_object))
        .flat_map(|source| source.keys())
        .collect();

    let mut columns = vec!["_id".to_string(), "_index".to_string()];
    columns.extend(fields.iter().map(|field| (*field).clone()));

    let rows = hits
        .iter()
        .map(|hit| {
            let source = hit.get("_source");
            let mut row = vec![
                TableValue::from_json(hit.get("_id")),
                TableValue::from_json(hit.get("_index")),
            ];
            row.extend(fields.iter().map(|field| {
                TableValue::from_json(source.and_then(|source| source.get(field.as_str())))
            }));
            row
        })
        .collect();

    Ok(Table { columns, rows })
}
