//! Typed views over the free-form settings attached to grouping stages and
//! computations.
//!
//! Editors store settings loosely: numbers arrive either as JSON numbers or as
//! numeric strings, and unknown keys are common. Each known grouping kind gets a
//! typed view with its documented defaults; computation settings stay a
//! residual map that is normalised before being emitted into the request.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DefaultOnError, DisplayFromStr, PickFirst};
use tracing::debug;

use crate::models::{ComputationKind, GroupingKind};

pub type SettingsMap = Map<String, Value>;

pub const DEFAULT_TERMS_SIZE: i64 = 500;
pub const DEFAULT_HISTOGRAM_INTERVAL: i64 = 1000;
pub const DEFAULT_GEO_PRECISION: i64 = 3;
pub const DEFAULT_RAW_DOCUMENT_SIZE: i64 = 500;
pub const AUTO_INTERVAL: &str = "auto";
pub const EPOCH_MILLIS_FORMAT: &str = "epoch_millis";

fn typed_view<T>(settings: &SettingsMap) -> T
where
    T: DeserializeOwned + Default,
{
    match serde_json::from_value(Value::Object(settings.clone())) {
        Ok(view) => view,
        Err(err) => {
            debug!(error = %err, "falling back to default settings view");
            T::default()
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DateHistogramSettings {
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub interval: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
    pub min_doc_count: Option<i64>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub format: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub offset: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub time_zone: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub missing: Option<String>,
    #[serde(rename = "trimEdges")]
    #[serde_as(deserialize_as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
    pub trim_edges: Option<i64>,
}

impl DateHistogramSettings {
    /// Interval text, `None` when the stage asks for the automatic interval.
    pub fn fixed_interval(&self) -> Option<&str> {
        match self.interval.as_deref().map(str::trim) {
            None | Some("") | Some(AUTO_INTERVAL) => None,
            Some(other) => Some(other),
        }
    }

    pub fn format(&self) -> &str {
        self.format
            .as_deref()
            .filter(|format| !format.is_empty())
            .unwrap_or(EPOCH_MILLIS_FORMAT)
    }

    pub fn trim_edges(&self) -> usize {
        self.trim_edges
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or(0)
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistogramSettings {
    #[serde_as(deserialize_as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
    pub interval: Option<i64>,
    #[serde_as(deserialize_as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
    pub min_doc_count: Option<i64>,
    #[serde_as(deserialize_as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
    pub missing: Option<i64>,
}

impl HistogramSettings {
    pub fn interval(&self) -> i64 {
        self.interval
            .filter(|interval| *interval > 0)
            .unwrap_or(DEFAULT_HISTOGRAM_INTERVAL)
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TermsSettings {
    #[serde_as(deserialize_as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
    pub size: Option<i64>,
    #[serde_as(deserialize_as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
    pub min_doc_count: Option<i64>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub missing: Option<String>,
    #[serde(rename = "orderBy")]
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub order_by: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub order: Option<String>,
}

impl TermsSettings {
    /// Requested bucket count; missing, zero and unparsable sizes fall back to 500.
    pub fn size(&self) -> i64 {
        match self.size {
            Some(size) if size > 0 => size,
            _ => DEFAULT_TERMS_SIZE,
        }
    }

    pub fn order(&self) -> &str {
        self.order
            .as_deref()
            .filter(|order| !order.is_empty())
            .unwrap_or("desc")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterItem {
    pub query: String,
    pub label: String,
}

impl FilterItem {
    pub fn label(&self) -> &str {
        if self.label.is_empty() {
            &self.query
        } else {
            &self.label
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FiltersSettings {
    #[serde_as(deserialize_as = "DefaultOnError")]
    pub filters: Vec<FilterItem>,
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeoGridSettings {
    #[serde_as(deserialize_as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
    pub precision: Option<i64>,
}

impl GeoGridSettings {
    pub fn precision(&self) -> i64 {
        self.precision.unwrap_or(DEFAULT_GEO_PRECISION)
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDocumentSettings {
    #[serde_as(deserialize_as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
    pub size: Option<i64>,
}

impl RawDocumentSettings {
    pub fn size(&self) -> i64 {
        match self.size {
            Some(size) if size > 0 => size,
            _ => DEFAULT_RAW_DOCUMENT_SIZE,
        }
    }
}

/// Settings of one grouping stage, resolved against its kind.
#[derive(Debug, Clone)]
pub enum GroupingSettings {
    DateHistogram(DateHistogramSettings),
    Histogram(HistogramSettings),
    Terms(TermsSettings),
    Filters(FiltersSettings),
    GeoGrid(GeoGridSettings),
}

impl GroupingSettings {
    /// Typed settings for a grouping kind; `None` for kinds the builder cannot compile.
    pub fn resolve(kind: &GroupingKind, settings: &SettingsMap) -> Option<Self> {
        let resolved = match kind {
            GroupingKind::DateHistogram => Self::DateHistogram(typed_view(settings)),
            GroupingKind::Histogram => Self::Histogram(typed_view(settings)),
            GroupingKind::Terms => Self::Terms(typed_view(settings)),
            GroupingKind::Filters => Self::Filters(typed_view(settings)),
            GroupingKind::GeohashGrid => Self::GeoGrid(typed_view(settings)),
            GroupingKind::Other(_) => return None,
        };
        Some(resolved)
    }
}

pub fn date_histogram_settings(settings: &SettingsMap) -> DateHistogramSettings {
    typed_view(settings)
}

pub fn raw_document_settings(settings: &SettingsMap) -> RawDocumentSettings {
    typed_view(settings)
}

/// Script text of a computation, accepting both `script: "..."` and the older
/// `script: {inline: "..."}` shape.
pub fn script_text(settings: &SettingsMap) -> Option<&str> {
    match settings.get("script") {
        Some(Value::String(script)) => Some(script.as_str()),
        Some(Value::Object(inner)) => inner.get("inline").and_then(Value::as_str),
        _ => None,
    }
}

/// Normalises computation settings into the shape the query DSL expects.
pub fn computation_dsl_settings(kind: &ComputationKind, settings: &SettingsMap) -> SettingsMap {
    let mut shaped = settings.clone();

    match kind {
        ComputationKind::MovingAvg => {
            coerce_float(&mut shaped, &["window"]);
            coerce_float(&mut shaped, &["predict"]);
            for key in ["alpha", "beta", "gamma", "period"] {
                coerce_float(&mut shaped, &["settings", key]);
            }
        }
        ComputationKind::SerialDiff => coerce_float(&mut shaped, &["lag"]),
        _ => {}
    }

    if kind.supports_inline_script() {
        if let Some(script) = script_text(settings).map(str::to_string) {
            shaped.insert("script".to_string(), Value::String(script));
        }
    }

    shaped.retain(|key, value| !key.is_empty() && !value.is_null());
    shaped
}

fn coerce_float(settings: &mut SettingsMap, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = settings;
    for parent in parents {
        match current.get_mut(*parent) {
            Some(Value::Object(inner)) => current = inner,
            _ => return,
        }
    }

    let parsed = match current.get(*last) {
        Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };

    if let Some(number) = parsed.and_then(serde_json::Number::from_f64) {
        current.insert((*last).to_string(), Value::Number(number));
    }
}
