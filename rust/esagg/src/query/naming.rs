//! Turns the label bag of each decoded series into its display name.

use super::{
    pipeline,
    response::{Labels, ResultSeries, FIELD_LABEL, METRIC_ID_LABEL, METRIC_LABEL},
};
use crate::models::{metric_display_name, QueryDefinition};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeSet;

static ALIAS_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([\s\S]+?)\}\}").expect("alias placeholder pattern is valid"));

const TERM_PREFIX: &str = "term ";

/// Names every series of `query` and strips the labels consumed by naming.
pub fn name_series(query: &QueryDefinition, series: &mut [ResultSeries]) {
    let metric_type_count = series
        .iter()
        .filter_map(|series| series.labels.get(METRIC_LABEL))
        .collect::<BTreeSet<_>>()
        .len();

    for series in series.iter_mut() {
        series.name = series_name(query, series, metric_type_count);
    }
}

fn series_name(query: &QueryDefinition, series: &mut ResultSeries, metric_type_count: usize) -> String {
    let metric_type = series.labels.remove(METRIC_LABEL).unwrap_or_default();
    let field = series.labels.remove(FIELD_LABEL).unwrap_or_default();
    let mut metric_name = metric_display_name(&metric_type);

    if !query.alias.is_empty() {
        let name = render_alias(&query.alias, &series.labels, &metric_name, &field);
        series.labels.remove(METRIC_ID_LABEL);
        return name;
    }

    let computation = series
        .labels
        .remove(METRIC_ID_LABEL)
        .and_then(|id| query.computation(&id));
    match computation {
        Some(metric)
            if metric.kind().is_pipeline()
                && (metric.kind().has_multiple_bucket_paths() || !field.is_empty()) =>
        {
            metric_name = pipeline::pipeline_display_name(metric, &query.computations);
        }
        _ if !field.is_empty() => metric_name = format!("{metric_name} {field}"),
        _ => {}
    }

    if series.labels.is_empty() {
        return metric_name;
    }

    let grouping = series
        .labels
        .values()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    if metric_type_count == 1 {
        grouping
    } else {
        format!("{grouping} {metric_name}")
    }
}

/// Expands `{{...}}` placeholders; anything unresolvable stays as written.
fn render_alias(alias: &str, labels: &Labels, metric_name: &str, field: &str) -> String {
    ALIAS_PLACEHOLDER
        .replace_all(alias, |captures: &Captures<'_>| {
            let placeholder = &captures[1];
            let resolved = if let Some(label) = placeholder.strip_prefix(TERM_PREFIX) {
                labels.get(label).map(String::as_str)
            } else if let Some(value) = labels.get(placeholder) {
                Some(value.as_str())
            } else if placeholder == METRIC_LABEL {
                Some(metric_name)
            } else if placeholder == FIELD_LABEL {
                Some(field)
            } else {
                None
            };
            resolved.unwrap_or(&captures[0]).to_string()
        })
        .into_owned()
}
