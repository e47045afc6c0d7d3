//! Pipeline computations: bucket paths on the way out, readable descriptions
//! on the way back.

use crate::{
    models::{metric_display_name, Computation, ComputationKind},
    settings::script_text,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Bucket path token the engine resolves to the bucket document count.
pub const COUNT_BUCKET_PATH: &str = "_count";

const UNSET: &str = "Unset";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketPath {
    Single(String),
    Multiple(BTreeMap<String, String>),
}

impl BucketPath {
    pub fn to_value(&self) -> Value {
        match self {
            BucketPath::Single(path) => Value::String(path.clone()),
            BucketPath::Multiple(paths) => Value::Object(
                paths
                    .iter()
                    .map(|(name, path)| (name.clone(), Value::String(path.clone())))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    /// Path segment reading `target`'s output.
    fn path_of(target: &Computation) -> String {
        if matches!(target.kind(), ComputationKind::Count) {
            COUNT_BUCKET_PATH.to_string()
        } else {
            target.id.clone()
        }
    }
}

fn sibling<'a>(siblings: &'a [Computation], id: &str) -> Option<&'a Computation> {
    siblings.iter().find(|candidate| candidate.id == id)
}

/// Resolves the bucket path of a pipeline computation against its siblings.
///
/// Returns `None` when a reference cannot be resolved; the computation is then
/// left out of the request instead of failing the whole query.
pub fn resolve_bucket_path(metric: &Computation, siblings: &[Computation]) -> Option<BucketPath> {
    if metric.kind().has_multiple_bucket_paths() {
        if metric.pipeline_references.is_empty() {
            debug!(metric_id = %metric.id, "pipeline has no references, skipping");
            return None;
        }

        let mut paths = BTreeMap::new();
        for (name, target_id) in &metric.pipeline_references {
            let Some(target) = sibling(siblings, target_id) else {
                debug!(
                    metric_id = %metric.id,
                    variable = %name,
                    target = %target_id,
                    "unresolved pipeline reference, skipping"
                );
                return None;
            };
            paths.insert(name.clone(), BucketPath::path_of(target));
        }
        return Some(BucketPath::Multiple(paths));
    }

    match sibling(siblings, &metric.field) {
        Some(target) => Some(BucketPath::Single(BucketPath::path_of(target))),
        None => {
            debug!(
                metric_id = %metric.id,
                target = %metric.field,
                "unresolved pipeline reference, skipping"
            );
            None
        }
    }
}

/// Ids a pipeline reads from, used to keep hidden inputs in the request.
pub fn referenced_ids(metric: &Computation) -> Vec<&str> {
    if !metric.kind().is_pipeline() {
        return Vec::new();
    }
    if metric.kind().has_multiple_bucket_paths() {
        metric
            .pipeline_references
            .values()
            .map(String::as_str)
            .collect()
    } else if metric.field.is_empty() {
        Vec::new()
    } else {
        vec![metric.field.as_str()]
    }
}

/// "Average bytes", or just "Count" for the row count.
pub fn describe(kind: &ComputationKind, field: &str) -> String {
    let name = kind.display_name();
    if matches!(kind, ComputationKind::Count) || field.is_empty() {
        name
    } else {
        format!("{name} {field}")
    }
}

/// Display name of a pipeline computation in terms of the computations it reads.
pub fn pipeline_display_name(metric: &Computation, siblings: &[Computation]) -> String {
    if metric.kind().has_multiple_bucket_paths() {
        return script_display_name(metric, siblings);
    }

    match sibling(siblings, &metric.field) {
        Some(target) => format!(
            "{} {}",
            metric_display_name(metric.kind().keyword()),
            describe(target.kind(), &target.field)
        ),
        None => UNSET.to_string(),
    }
}

fn script_display_name(metric: &Computation, siblings: &[Computation]) -> String {
    let Some(script) = script_text(&metric.settings) else {
        return UNSET.to_string();
    };

    let mut references: Vec<(&String, &String)> = metric.pipeline_references.iter().collect();
    // `params.var10` must be rewritten before `params.var1`.
    references.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

    let mut name = script.to_string();
    for (variable, target_id) in references {
        let Some(target) = sibling(siblings, target_id) else {
            return UNSET.to_string();
        };
        name = name.replace(
            &format!("params.{variable}"),
            &describe(target.kind(), &target.field),
        );
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn computations(value: Value) -> Vec<Computation> {
        serde_json::from_value(value).expect("computations should deserialize")
    }

    #[test]
    fn count_reference_uses_count_token() {
        let metrics = computations(json!([
            {"id": "1", "type": "count"},
            {"id": "2", "type": "derivative", "field": "1"}
        ]));
        assert_eq!(
            resolve_bucket_path(&metrics[1], &metrics),
            Some(BucketPath::Single("_count".to_string()))
        );
    }

    #[test]
    fn metric_reference_uses_sibling_id() {
        let metrics = computations(json!([
            {"id": "3", "type": "avg", "field": "bytes"},
            {"id": "4", "type": "moving_avg", "field": "3"}
        ]));
        assert_eq!(
            resolve_bucket_path(&metrics[1], &metrics),
            Some(BucketPath::Single("3".to_string()))
        );
    }

    #[test]
    fn multi_reference_resolves_each_variable() {
        let metrics = computations(json!([
            {"id": "1", "type": "count"},
            {"id": "3", "type": "sum", "field": "bytes"},
            {
                "id": "5",
                "type": "bucket_script",
                "pipelineVariables": [
                    {"name": "hits", "pipelineAgg": "1"},
                    {"name": "total", "pipelineAgg": "3"}
                ],
                "settings": {"script": "params.total / params.hits"}
            }
        ]));

        let path = resolve_bucket_path(&metrics[2], &metrics).expect("path should resolve");
        assert_eq!(path.to_value(), json!({"hits": "_count", "total": "3"}));
    }

    #[test]
    fn multi_reference_with_unknown_target_is_skipped() {
        let metrics = computations(json!([
            {"id": "1", "type": "count"},
            {
                "id": "5",
                "type": "bucket_script",
                "pipelineVariables": {"a": "1", "b": "42"},
                "settings": {"script": "params.a + params.b"}
            }
        ]));
        assert_eq!(resolve_bucket_path(&metrics[1], &metrics), None);
        assert_eq!(pipeline_display_name(&metrics[1], &metrics), "Unset");
    }

    #[test]
    fn script_name_describes_inputs() {
        let metrics = computations(json!([
            {"id": "1", "type": "count"},
            {"id": "3", "type": "avg", "field": "bytes"},
            {
                "id": "5",
                "type": "bucket_script",
                "pipelineVariables": {"var1": "1", "var10": "3"},
                "settings": {"script": {"inline": "params.var10 / params.var1"}}
            }
        ]));
        assert_eq!(
            pipeline_display_name(&metrics[2], &metrics),
            "Average bytes / Count"
        );
    }

    #[test]
    fn single_reference_name_describes_input() {
        let metrics = computations(json!([
            {"id": "3", "type": "max", "field": "latency"},
            {"id": "4", "type": "derivative", "field": "3"},
            {"id": "6", "type": "cumulative_sum", "field": "9"}
        ]));
        assert_eq!(
            pipeline_display_name(&metrics[1], &metrics),
            "Derivative Max latency"
        );
        assert_eq!(pipeline_display_name(&metrics[2], &metrics), "Unset");
    }
}
