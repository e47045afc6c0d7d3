//! Compiles a flat query definition into the nested aggregation tree of a
//! search request: one level per grouping stage, computations innermost.

use super::pipeline;
use crate::{
    dialect::Dialect,
    error::{Result, ServiceError},
    models::{Computation, ComputationKind, GroupingKind, GroupingStage, QueryDefinition},
    settings::{
        computation_dsl_settings, DateHistogramSettings, FiltersSettings, GeoGridSettings,
        GroupingSettings, HistogramSettings, TermsSettings,
    },
    time::TimeRange,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Placeholder for the resolved interval text, substituted after serialization.
pub const INTERVAL_PLACEHOLDER: &str = "$__interval";
/// Placeholder for the resolved interval in milliseconds.
pub const INTERVAL_MS_PLACEHOLDER: &str = "$__interval_ms";

static ORDER_BY_METRIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)").expect("orderBy metric pattern is valid"));

/// One aggregation container of the request tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestNode {
    pub key: String,
    pub kind: String,
    pub parameters: Map<String, Value>,
    pub children: Vec<RequestNode>,
}

impl RequestNode {
    fn new(
        key: impl Into<String>,
        kind: impl Into<String>,
        parameters: Map<String, Value>,
    ) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            parameters,
            children: Vec::new(),
        }
    }

    /// `{"<kind>": {...}, "aggs": {...}}`
    pub fn to_json(&self) -> Value {
        let mut container = Map::new();
        container.insert(self.kind.clone(), Value::Object(self.parameters.clone()));
        if !self.children.is_empty() {
            container.insert("aggs".to_string(), aggs_to_json(&self.children));
        }
        Value::Object(container)
    }

    fn attach(&mut self, children: Vec<RequestNode>) {
        let own = std::mem::replace(&mut self.children, children);
        for child in own {
            if !self.children.iter().any(|existing| existing.key == child.key) {
                self.children.push(child);
            }
        }
    }
}

pub fn aggs_to_json(nodes: &[RequestNode]) -> Value {
    Value::Object(
        nodes
            .iter()
            .map(|node| (node.key.clone(), node.to_json()))
            .collect(),
    )
}

#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub dialect: Dialect,
    pub time_range: &'a TimeRange,
    pub time_field: &'a str,
}

/// Builds the aggregation tree of `query`. The returned list holds the
/// outermost level: the first grouping stage, wrapping everything else.
pub fn build_aggregations(
    query: &QueryDefinition,
    ctx: &BuildContext<'_>,
) -> Result<Vec<RequestNode>> {
    query.validate()?;

    let mut level = computation_nodes(query);
    for stage in query.grouping_stages.iter().rev() {
        let mut node = stage_node(stage, query, ctx)?;
        node.attach(level);
        level = vec![node];
    }
    Ok(level)
}

fn stage_node(
    stage: &GroupingStage,
    query: &QueryDefinition,
    ctx: &BuildContext<'_>,
) -> Result<RequestNode> {
    let kind = stage.kind.as_ref().ok_or_else(|| {
        ServiceError::definition(format!("grouping stage '{}' is missing a type", stage.id))
    })?;
    let settings = GroupingSettings::resolve(kind, &stage.settings).ok_or_else(|| {
        ServiceError::definition(format!(
            "grouping stage '{}' has unsupported type '{}'",
            stage.id,
            kind.keyword()
        ))
    })?;

    let node = match settings {
        GroupingSettings::DateHistogram(settings) => date_histogram(stage, &settings, ctx),
        GroupingSettings::Histogram(settings) => histogram(stage, &settings),
        GroupingSettings::Terms(settings) => terms(stage, &settings, query, ctx),
        GroupingSettings::Filters(settings) => filters(stage, &settings)?,
        GroupingSettings::GeoGrid(settings) => geohash_grid(stage, &settings),
    };
    Ok(node)
}

fn date_histogram(
    stage: &GroupingStage,
    settings: &DateHistogramSettings,
    ctx: &BuildContext<'_>,
) -> RequestNode {
    let mut params = Map::new();
    let field = if stage.field.is_empty() {
        ctx.time_field
    } else {
        stage.field.as_str()
    };
    params.insert("field".into(), json!(field));

    let interval_key = if ctx.dialect.uses_fixed_interval() {
        "fixed_interval"
    } else {
        "interval"
    };
    let interval = settings.fixed_interval().unwrap_or(INTERVAL_PLACEHOLDER);
    params.insert(interval_key.into(), json!(interval));

    params.insert(
        "min_doc_count".into(),
        json!(settings.min_doc_count.unwrap_or(0)),
    );
    params.insert(
        "extended_bounds".into(),
        json!({
            "min": ctx.time_range.start_millis(),
            "max": ctx.time_range.end_millis(),
        }),
    );
    params.insert("format".into(), json!(settings.format()));

    for (key, value) in [
        ("offset", &settings.offset),
        ("time_zone", &settings.time_zone),
        ("missing", &settings.missing),
    ] {
        if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
            params.insert(key.into(), json!(value));
        }
    }

    RequestNode::new(&stage.id, GroupingKind::DateHistogram.keyword(), params)
}

fn histogram(stage: &GroupingStage, settings: &HistogramSettings) -> RequestNode {
    let mut params = Map::new();
    params.insert("field".into(), json!(stage.field));
    params.insert("interval".into(), json!(settings.interval()));
    params.insert("min_doc_count".into(), json!(settings.min_doc_count.unwrap_or(0)));
    if let Some(missing) = settings.missing {
        params.insert("missing".into(), json!(missing));
    }
    RequestNode::new(&stage.id, GroupingKind::Histogram.keyword(), params)
}

fn terms(
    stage: &GroupingStage,
    settings: &TermsSettings,
    query: &QueryDefinition,
    ctx: &BuildContext<'_>,
) -> RequestNode {
    let mut params = Map::new();
    params.insert("field".into(), json!(stage.field));
    params.insert("size".into(), json!(settings.size()));
    if let Some(min_doc_count) = settings.min_doc_count {
        params.insert("min_doc_count".into(), json!(min_doc_count));
    }
    if let Some(missing) = settings.missing.as_deref().filter(|missing| !missing.is_empty()) {
        params.insert("missing".into(), json!(missing));
    }

    let mut order_child = None;
    if let Some(order_by) = settings.order_by.as_deref().filter(|order_by| !order_by.is_empty()) {
        let mut order_key = order_by.to_string();

        let ordered_metric = ORDER_BY_METRIC
            .captures(order_by)
            .and_then(|captures| captures.get(1))
            .and_then(|id| query.computation(id.as_str()));
        if let Some(metric) = ordered_metric {
            if matches!(metric.kind(), ComputationKind::Count) {
                order_key = pipeline::COUNT_BUCKET_PATH.to_string();
            } else {
                order_child = Some(metric_node(metric));
            }
        }

        if order_key == "_term" && ctx.dialect.renames_term_order() {
            order_key = "_key".to_string();
        }

        let mut order = Map::new();
        order.insert(order_key, json!(settings.order()));
        params.insert("order".into(), Value::Object(order));
    }

    let mut node = RequestNode::new(&stage.id, GroupingKind::Terms.keyword(), params);
    node.children.extend(order_child);
    node
}

fn filters(stage: &GroupingStage, settings: &FiltersSettings) -> Result<RequestNode> {
    if settings.filters.is_empty() {
        return Err(ServiceError::definition(format!(
            "filters stage '{}' has no filters",
            stage.id
        )));
    }

    let mut compiled = Map::new();
    for item in &settings.filters {
        let query = match item.query.trim() {
            "" => "*",
            query => query,
        };
        let label = match item.label() {
            "" => query,
            label => label,
        };
        compiled.insert(
            label.to_string(),
            json!({"query_string": {"query": query, "analyze_wildcard": true}}),
        );
    }

    let mut params = Map::new();
    params.insert("filters".into(), Value::Object(compiled));
    Ok(RequestNode::new(&stage.id, GroupingKind::Filters.keyword(), params))
}

fn geohash_grid(stage: &GroupingStage, settings: &GeoGridSettings) -> RequestNode {
    let mut params = Map::new();
    params.insert("field".into(), json!(stage.field));
    params.insert("precision".into(), json!(settings.precision()));
    RequestNode::new(&stage.id, GroupingKind::GeohashGrid.keyword(), params)
}

/// Computations emitted into the request: every visible one, plus hidden ones
/// an emitted pipeline reads from.
fn emitted_ids(query: &QueryDefinition) -> BTreeSet<&str> {
    let mut emitted: BTreeSet<&str> = query
        .computations
        .iter()
        .filter(|metric| !metric.hidden)
        .map(|metric| metric.id.as_str())
        .collect();

    loop {
        let referenced: Vec<&str> = query
            .computations
            .iter()
            .filter(|metric| emitted.contains(metric.id.as_str()))
            .flat_map(pipeline::referenced_ids)
            .filter(|id| !emitted.contains(id) && query.computation(id).is_some())
            .collect();
        if referenced.is_empty() {
            return emitted;
        }
        emitted.extend(referenced);
    }
}

fn computation_nodes(query: &QueryDefinition) -> Vec<RequestNode> {
    let emitted = emitted_ids(query);

    query
        .computations
        .iter()
        .filter(|metric| emitted.contains(metric.id.as_str()))
        .filter_map(|metric| match metric.kind() {
            ComputationKind::Count | ComputationKind::RawDocument | ComputationKind::RawData => {
                None
            }
            kind if kind.is_pipeline() => pipeline_node(metric, &query.computations),
            _ => Some(metric_node(metric)),
        })
        .collect()
}

fn metric_node(metric: &Computation) -> RequestNode {
    let mut params = Map::new();
    if !metric.field.is_empty() {
        params.insert("field".into(), json!(metric.field));
    }
    params.extend(computation_dsl_settings(metric.kind(), &metric.settings));
    RequestNode::new(&metric.id, metric.kind().keyword(), params)
}

fn pipeline_node(metric: &Computation, siblings: &[Computation]) -> Option<RequestNode> {
    let path = pipeline::resolve_bucket_path(metric, siblings)?;

    let mut params = computation_dsl_settings(metric.kind(), &metric.settings);
    params.insert("buckets_path".into(), path.to_value());
    Some(RequestNode::new(&metric.id, metric.kind().keyword(), params))
}
