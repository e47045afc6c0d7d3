//! Search request bodies and the newline-delimited multi-search batch that
//! carries them.

use super::builder::{
    aggs_to_json, BuildContext, RequestNode, INTERVAL_MS_PLACEHOLDER, INTERVAL_PLACEHOLDER,
};
use crate::{
    dialect::{Dialect, ShardRequestLimit},
    error::{Result, ServiceError},
    models::QueryDefinition,
    settings::{raw_document_settings, DEFAULT_RAW_DOCUMENT_SIZE, EPOCH_MILLIS_FORMAT},
    time::Interval,
};
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Header line preceding each body in a multi-search payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiSearchHeader {
    pub search_type: &'static str,
    pub ignore_unavailable: bool,
    pub index: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_shard_requests: Option<i64>,
}

impl MultiSearchHeader {
    pub fn new(dialect: &Dialect, indices: &[String], limit: Option<ShardRequestLimit>) -> Self {
        let max_concurrent_shard_requests = match limit {
            Some(ShardRequestLimit::Header(limit)) => Some(limit),
            _ => None,
        };

        Self {
            search_type: dialect.search_type(),
            ignore_unavailable: true,
            index: indices.join(","),
            max_concurrent_shard_requests,
        }
    }
}

/// Query string for the multi-search endpoint, when the dialect moves the
/// shard request limit there.
pub fn query_params(limit: Option<ShardRequestLimit>) -> Option<String> {
    match limit {
        Some(ShardRequestLimit::QueryParam(limit)) => {
            Some(format!("max_concurrent_shard_requests={limit}"))
        }
        _ => None,
    }
}

fn filter_query(query: &QueryDefinition, ctx: &BuildContext<'_>) -> Value {
    let mut range = Map::new();
    range.insert(
        ctx.time_field.to_string(),
        json!({
            "gte": ctx.time_range.start_millis(),
            "lte": ctx.time_range.end_millis(),
            "format": EPOCH_MILLIS_FORMAT,
        }),
    );

    let mut filters = vec![json!({ "range": range })];
    let text = query.raw_filter_text.trim();
    if !text.is_empty() {
        filters.push(json!({
            "query_string": {"query": text, "analyze_wildcard": true}
        }));
    }

    let filter = if filters.len() == 1 {
        filters.remove(0)
    } else {
        Value::Array(filters)
    };
    json!({ "bool": { "filter": filter } })
}

/// Body of an aggregation query.
pub fn search_body(
    query: &QueryDefinition,
    aggs: &[RequestNode],
    ctx: &BuildContext<'_>,
) -> Value {
    let mut body = Map::new();
    body.insert("size".into(), json!(0));
    body.insert("query".into(), filter_query(query, ctx));
    if !aggs.is_empty() {
        body.insert("aggs".into(), aggs_to_json(aggs));
    }
    Value::Object(body)
}

/// Body of a raw document query: the newest hits, no aggregations.
pub fn raw_document_body(query: &QueryDefinition, ctx: &BuildContext<'_>) -> Value {
    let size = query
        .computations
        .first()
        .map(|metric| raw_document_settings(&metric.settings).size())
        .unwrap_or(DEFAULT_RAW_DOCUMENT_SIZE);

    let mut time_sort = Map::new();
    time_sort.insert(
        ctx.time_field.to_string(),
        json!({"order": "desc", "unmapped_type": "boolean"}),
    );

    let mut body = Map::new();
    body.insert("size".into(), json!(size));
    body.insert("sort".into(), json!([time_sort, {"_doc": {"order": "desc"}}]));
    body.insert("query".into(), filter_query(query, ctx));
    body.insert("script_fields".into(), json!({}));
    if ctx.dialect.uses_docvalue_fields() {
        body.insert("docvalue_fields".into(), json!([ctx.time_field]));
    } else {
        body.insert("fielddata_fields".into(), json!([ctx.time_field]));
        body.insert("fields".into(), json!(["*", "_source"]));
    }
    Value::Object(body)
}

/// Replaces the interval placeholders in serialized request text. The
/// millisecond form goes first since the text form is its prefix.
pub fn substitute_interval(text: &str, interval: &Interval) -> String {
    text.replace(INTERVAL_MS_PLACEHOLDER, &interval.millis().to_string())
        .replace(INTERVAL_PLACEHOLDER, interval.text())
}

#[derive(Debug, Clone)]
struct BatchEntry {
    header: MultiSearchHeader,
    body: Value,
    interval: Interval,
}

#[derive(Debug, Clone, Default)]
pub struct MultiSearchBatch {
    entries: Vec<BatchEntry>,
}

impl MultiSearchBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: MultiSearchHeader, body: Value, interval: Interval) {
        self.entries.push(BatchEntry {
            header,
            body,
            interval,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newline-delimited payload: header line, body line, per entry.
    pub fn encode(&self) -> Result<String> {
        let mut payload = String::new();
        for entry in &self.entries {
            let header = serde_json::to_string(&entry.header)
                .map_err(|err| ServiceError::Internal(err.into()))?;
            let body = serde_json::to_string(&entry.body)
                .map_err(|err| ServiceError::Internal(err.into()))?;

            payload.push_str(&header);
            payload.push('\n');
            payload.push_str(&substitute_interval(&body, &entry.interval));
            payload.push('\n');
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dialect::{EngineFlavor, EngineVersion},
        time::TimeRange,
    };
    use pretty_assertions::assert_eq;

    fn definition(value: Value) -> QueryDefinition {
        serde_json::from_value(value).expect("definition should deserialize")
    }

    fn with_ctx<T>(version: EngineVersion, f: impl FnOnce(&BuildContext<'_>) -> T) -> T {
        let range = TimeRange::from_millis(10, 20).unwrap();
        let ctx = BuildContext {
            dialect: Dialect::new(EngineFlavor::Elasticsearch, version),
            time_range: &range,
            time_field: "@timestamp",
        };
        f(&ctx)
    }

    #[test]
    fn single_filter_is_an_object_and_several_an_array() {
        let bare = definition(json!({"refId": "A"}));
        let body = with_ctx(EngineVersion::default(), |ctx| search_body(&bare, &[], ctx));
        assert_eq!(
            body,
            json!({
                "size": 0,
                "query": {"bool": {"filter": {
                    "range": {"@timestamp": {"gte": 10, "lte": 20, "format": "epoch_millis"}}
                }}}
            })
        );

        let filtered = definition(json!({"refId": "A", "query": "host:web*"}));
        let body = with_ctx(EngineVersion::default(), |ctx| search_body(&filtered, &[], ctx));
        assert_eq!(
            body["query"]["bool"]["filter"][1],
            json!({"query_string": {"query": "host:web*", "analyze_wildcard": true}})
        );
    }

    #[test]
    fn raw_documents_depend_on_version() {
        let query = definition(json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "raw_document", "settings": {"size": "20"}}]
        }));

        let body = with_ctx(EngineVersion::new(7, 10, 0), |ctx| raw_document_body(&query, ctx));
        assert_eq!(body["size"], json!(20));
        assert_eq!(body["docvalue_fields"], json!(["@timestamp"]));
        assert_eq!(
            body["sort"][0],
            json!({"@timestamp": {"order": "desc", "unmapped_type": "boolean"}})
        );

        let legacy = with_ctx(EngineVersion::new(2, 4, 0), |ctx| raw_document_body(&query, ctx));
        assert_eq!(legacy["fielddata_fields"], json!(["@timestamp"]));
        assert_eq!(legacy["fields"], json!(["*", "_source"]));
        assert!(legacy.get("docvalue_fields").is_none());
    }

    #[test]
    fn header_carries_shard_limit_for_mid_versions() {
        let dialect = Dialect::new(EngineFlavor::Elasticsearch, EngineVersion::new(6, 8, 0));
        let limit = dialect.shard_request_limit(None);
        let header = MultiSearchHeader::new(&dialect, &["a".to_string(), "b".to_string()], limit);

        assert_eq!(
            serde_json::to_value(&header).unwrap(),
            json!({
                "search_type": "query_then_fetch",
                "ignore_unavailable": true,
                "index": "a,b",
                "max_concurrent_shard_requests": 256
            })
        );
        assert_eq!(query_params(limit), None);
    }

    #[test]
    fn modern_versions_use_query_params() {
        let dialect = Dialect::default();
        let limit = dialect.shard_request_limit(Some(12));
        let header = MultiSearchHeader::new(&dialect, &["logs".to_string()], limit);

        assert_eq!(header.max_concurrent_shard_requests, None);
        assert_eq!(
            query_params(limit).as_deref(),
            Some("max_concurrent_shard_requests=12")
        );
    }

    #[test]
    fn encodes_batch_with_interval_substitution() {
        let dialect = Dialect::default();
        let mut batch = MultiSearchBatch::new();
        batch.push(
            MultiSearchHeader::new(&dialect, &["logs".to_string()], None),
            json!({"aggs": {"script": "_value / $__interval_ms", "interval": "$__interval"}}),
            Interval::parse("30s").unwrap(),
        );
        batch.push(
            MultiSearchHeader::new(&dialect, &["metrics".to_string()], None),
            json!({"size": 0}),
            Interval::parse("1m").unwrap(),
        );

        let payload = batch.encode().unwrap();
        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(payload.ends_with('\n'));

        let first: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(
            first,
            json!({"aggs": {"script": "_value / 30000", "interval": "30s"}})
        );
        let header: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(header["index"], json!("metrics"));
    }
}
