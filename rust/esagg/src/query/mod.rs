//! Translation of query definitions into one multi-search payload, and of the
//! engine's answer back into named series per query.

pub mod builder;
pub mod naming;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod trim;

use crate::{
    config::AppConfig,
    dialect::{Dialect, EngineFlavor, EngineVersion, ShardRequestLimit},
    error::{Result, ServiceError},
    index_pattern::{IndexInterval, IndexPattern},
    models::QueryDefinition,
    time::{Interval, TimeRange},
};
use builder::BuildContext;
use chrono::Duration;
use request::{MultiSearchBatch, MultiSearchHeader};
use response::{ResultSeries, Table};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

const MIN_INTERVAL_SECS: i64 = 10;

#[derive(Clone)]
pub struct QueryEngine {
    config: Arc<AppConfig>,
}

impl QueryEngine {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Compiles every query into one newline-delimited multi-search payload.
    /// Queries with a broken definition are reported in `errors` and left out.
    pub fn translate(&self, request: TranslateRequest) -> Result<TranslateResponse> {
        if request.queries.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "at least one query is required".to_string(),
            ));
        }

        let datasource = self.resolve_datasource(request.datasource.as_ref());
        let shard_limit = datasource
            .dialect
            .shard_request_limit(datasource.max_concurrent_shard_requests);

        let mut batch = MultiSearchBatch::new();
        let mut ref_ids = Vec::with_capacity(request.queries.len());
        let mut errors = BTreeMap::new();

        for query in &request.queries {
            match compile_query(&datasource, query, &request.time_range, shard_limit) {
                Ok(compiled) => {
                    batch.push(compiled.header, compiled.body, compiled.interval);
                    ref_ids.push(query.id.clone());
                }
                Err(err @ (ServiceError::InvalidDefinition(_) | ServiceError::InvalidRequest(_))) => {
                    warn!(ref_id = %query.id, error = %err, "query left out of the batch");
                    errors.insert(query.id.clone(), err.to_string());
                }
                Err(err) => return Err(err),
            }
        }

        debug!(queries = batch.len(), "encoded multi-search payload");
        Ok(TranslateResponse {
            payload: batch.encode()?,
            query_params: request::query_params(shard_limit),
            ref_ids,
            errors,
        })
    }

    /// Decodes a multi-search response; entry `i` answers `queries[i]`.
    /// Failures stay local to the query they belong to.
    pub fn decode(&self, request: DecodeRequest) -> Result<DecodeResponse> {
        let responses = match request.response.get("responses") {
            Some(Value::Array(responses)) => responses,
            _ => {
                if let Some(error) = request.response.get("error") {
                    return Err(ServiceError::Engine(response::engine_error_reason(error)));
                }
                return Err(ServiceError::InvalidRequest(
                    "response is missing the responses list".to_string(),
                ));
            }
        };

        let mut results = BTreeMap::new();
        for (index, query) in request.queries.iter().enumerate() {
            let decoded = match responses.get(index) {
                Some(entry) => decode_query(query, entry),
                None => Err(ServiceError::decode(format!(
                    "no response entry for query '{}'",
                    query.id
                ))),
            };

            let result = decoded.unwrap_or_else(|err| {
                warn!(ref_id = %query.id, error = %err, "query failed to decode");
                QueryResult::failed(&err)
            });
            results.insert(query.id.clone(), result);
        }

        Ok(DecodeResponse { results })
    }

    fn resolve_datasource(&self, overrides: Option<&DatasourceSettings>) -> ResolvedDatasource {
        let defaults = DatasourceSettings::default();
        let overrides = overrides.unwrap_or(&defaults);
        let config = self.config();

        let index = overrides.index.clone().unwrap_or_else(|| config.index.clone());
        let interval = match overrides.index {
            Some(_) => overrides.index_interval,
            None => overrides.index_interval.or(config.index_interval),
        };

        ResolvedDatasource {
            dialect: Dialect::new(
                overrides.flavor.unwrap_or(config.engine_flavor),
                overrides.version.unwrap_or(config.engine_version),
            ),
            index: IndexPattern::new(index, interval),
            time_field: overrides
                .time_field
                .clone()
                .filter(|field| !field.is_empty())
                .unwrap_or_else(|| config.time_field.clone()),
            max_concurrent_shard_requests: overrides
                .max_concurrent_shard_requests
                .or(config.max_concurrent_shard_requests),
        }
    }
}

struct ResolvedDatasource {
    dialect: Dialect,
    index: IndexPattern,
    time_field: String,
    max_concurrent_shard_requests: Option<i64>,
}

struct CompiledQuery {
    header: MultiSearchHeader,
    body: Value,
    interval: Interval,
}

fn compile_query(
    datasource: &ResolvedDatasource,
    query: &QueryDefinition,
    time_range: &TimeRange,
    shard_limit: Option<ShardRequestLimit>,
) -> Result<CompiledQuery> {
    query.validate()?;

    let range = query.time_range.as_ref().unwrap_or(time_range);
    let interval = query.interval()?.unwrap_or_else(|| {
        let minimum = Interval::from_duration(Duration::seconds(MIN_INTERVAL_SECS));
        Interval::calculate(range, query.max_data_points, &minimum)
    });

    let ctx = BuildContext {
        dialect: datasource.dialect,
        time_range: range,
        time_field: &datasource.time_field,
    };
    let body = if query.is_raw_document() {
        request::raw_document_body(query, &ctx)
    } else {
        let aggs = builder::build_aggregations(query, &ctx)?;
        request::search_body(query, &aggs, &ctx)
    };

    let indices = datasource.index.indices(range)?;
    if indices.is_empty() {
        return Err(ServiceError::InvalidRequest(
            "no index configured for the datasource".to_string(),
        ));
    }

    Ok(CompiledQuery {
        header: MultiSearchHeader::new(&datasource.dialect, &indices, shard_limit),
        body,
        interval,
    })
}

fn decode_query(query: &QueryDefinition, entry: &Value) -> Result<QueryResult> {
    let mut decoded = response::decode_response(query, entry)?;
    naming::name_series(query, &mut decoded.series);
    trim::trim_for_query(query, &mut decoded.series);

    Ok(QueryResult {
        series: decoded.series,
        table: decoded.table,
        error: None,
    })
}

/// Per-request overrides of the configured datasource.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasourceSettings {
    pub flavor: Option<EngineFlavor>,
    pub version: Option<EngineVersion>,
    pub index: Option<String>,
    pub index_interval: Option<IndexInterval>,
    pub time_field: Option<String>,
    pub max_concurrent_shard_requests: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslateRequest {
    #[serde(default)]
    pub datasource: Option<DatasourceSettings>,
    pub time_range: TimeRange,
    pub queries: Vec<QueryDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslateResponse {
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_params: Option<String>,
    /// Queries present in `payload`, in order.
    pub ref_ids: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecodeRequest {
    pub queries: Vec<QueryDefinition>,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecodeResponse {
    pub results: BTreeMap<String, QueryResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub series: Vec<ResultSeries>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<Table>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    fn failed(err: &ServiceError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> QueryEngine {
        QueryEngine::new(Arc::new(AppConfig {
            index: "logs-*".to_string(),
            ..AppConfig::default()
        }))
    }

    fn translate(value: Value) -> Result<TranslateResponse> {
        engine().translate(serde_json::from_value(value).expect("request should deserialize"))
    }

    fn decode(value: Value) -> DecodeResponse {
        engine()
            .decode(serde_json::from_value(value).expect("request should deserialize"))
            .expect("decode should succeed")
    }

    fn host_query() -> Value {
        json!({
            "refId": "A",
            "alias": "{{term host}} {{metric}}",
            "bucketAggs": [
                {"id": "2", "type": "terms", "field": "host", "settings": {"size": "5"}},
                {"id": "3", "type": "date_histogram", "field": "@timestamp", "settings": {"interval": "auto"}}
            ],
            "metrics": [{"id": "1", "type": "count"}]
        })
    }

    #[test]
    fn translates_batch_with_interval_substitution() {
        let response = translate(json!({
            "time_range": {"from": 0, "to": 21_600_000},
            "queries": [host_query()]
        }))
        .unwrap();

        assert_eq!(response.ref_ids, vec!["A"]);
        assert_eq!(
            response.query_params.as_deref(),
            Some("max_concurrent_shard_requests=5")
        );

        let lines: Vec<&str> = response.payload.lines().collect();
        assert_eq!(lines.len(), 2);
        let header: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(
            header,
            json!({"search_type": "query_then_fetch", "ignore_unavailable": true, "index": "logs-*"})
        );
        let body: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(
            body["aggs"]["2"]["aggs"]["3"]["date_histogram"]["fixed_interval"],
            json!("20s")
        );
        assert!(!response.payload.contains("$__interval"));
    }

    #[test]
    fn broken_definitions_are_left_out_of_the_batch() {
        let response = translate(json!({
            "time_range": {"from": 0, "to": 60_000},
            "queries": [
                {"refId": "bad", "bucketAggs": [{"id": "2", "field": "host"}], "metrics": [{"id": "1", "type": "count"}]},
                host_query()
            ]
        }))
        .unwrap();

        assert_eq!(response.ref_ids, vec!["A"]);
        assert!(response.errors.contains_key("bad"));
        assert_eq!(response.payload.lines().count(), 2);
    }

    #[test]
    fn datasource_overrides_shape_the_header() {
        let response = translate(json!({
            "datasource": {
                "version": "6.8.0",
                "index": "[logs-]YYYY.MM.DD",
                "index_interval": "daily",
                "max_concurrent_shard_requests": 32
            },
            "time_range": {"from": "2024-03-01T10:00:00Z", "to": "2024-03-02T10:00:00Z"},
            "queries": [host_query()]
        }))
        .unwrap();

        assert_eq!(response.query_params, None);
        let header: Value = serde_json::from_str(response.payload.lines().next().unwrap()).unwrap();
        assert_eq!(header["index"], json!("logs-2024.03.01,logs-2024.03.02"));
        assert_eq!(header["max_concurrent_shard_requests"], json!(32));
    }

    #[test]
    fn bad_interval_only_fails_its_own_query() {
        let mut blank = host_query();
        blank["refId"] = json!("A");
        blank["interval"] = json!("");
        let mut oversized = host_query();
        oversized["refId"] = json!("B");
        oversized["interval"] = json!("9999999999999999d");
        let mut explicit = host_query();
        explicit["refId"] = json!("C");
        explicit["interval"] = json!("1m");

        let response = translate(json!({
            "time_range": {"from": 0, "to": 21_600_000},
            "queries": [blank, oversized, explicit]
        }))
        .unwrap();

        assert_eq!(response.ref_ids, vec!["A", "C"]);
        assert!(response.errors["B"].contains("unsupported interval"));

        let bodies: Vec<Value> = response
            .payload
            .lines()
            .skip(1)
            .step_by(2)
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let interval = |body: &Value| body["aggs"]["2"]["aggs"]["3"]["date_histogram"]["fixed_interval"].clone();
        assert_eq!(interval(&bodies[0]), json!("20s"));
        assert_eq!(interval(&bodies[1]), json!("1m"));
    }

    #[test]
    fn empty_query_list_is_rejected() {
        let err = translate(json!({"time_range": {"from": 0, "to": 1}, "queries": []})).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[test]
    fn decodes_named_series_per_host() {
        let response = decode(json!({
            "queries": [host_query()],
            "response": {"responses": [{"aggregations": {"2": {"buckets": [
                {"key": "server2", "doc_count": 3, "3": {"buckets": [
                    {"key": 1000, "doc_count": 1}, {"key": 2000, "doc_count": 2}
                ]}},
                {"key": "server1", "doc_count": 5, "3": {"buckets": [
                    {"key": 1000, "doc_count": 4}, {"key": 2000, "doc_count": 1}
                ]}}
            ]}}}]}
        }));

        let result = &response.results["A"];
        assert_eq!(result.error, None);
        let names: Vec<&str> = result.series.iter().map(|series| series.name.as_str()).collect();
        assert_eq!(names, vec!["server2 Count", "server1 Count"]);
        assert_eq!(result.series[1].labels.get("host").map(String::as_str), Some("server1"));
        assert_eq!(result.series[1].points[0].value, Some(4.0));
    }

    #[test]
    fn extended_stats_are_named_per_statistic() {
        let response = decode(json!({
            "queries": [{
                "refId": "S",
                "bucketAggs": [{"id": "3", "type": "date_histogram", "field": "@timestamp"}],
                "metrics": [{
                    "id": "1",
                    "type": "extended_stats",
                    "field": "bytes",
                    "meta": {"max": true, "std_deviation_bounds_upper": true, "std_deviation_bounds_lower": true}
                }]
            }],
            "response": {"responses": [{"aggregations": {"3": {"buckets": [
                {"key": 1000, "doc_count": 1, "1": {"max": 10.2, "std_deviation_bounds": {"upper": 3, "lower": -2}}}
            ]}}}]}
        }));

        let named: Vec<(&str, Option<f64>)> = response.results["S"]
            .series
            .iter()
            .map(|series| (series.name.as_str(), series.points[0].value))
            .collect();
        assert_eq!(
            named,
            vec![
                ("Max bytes", Some(10.2)),
                ("Std Dev Lower bytes", Some(-2.0)),
                ("Std Dev Upper bytes", Some(3.0)),
            ]
        );
    }

    #[test]
    fn engine_errors_stay_with_their_query() {
        let response = decode(json!({
            "queries": [
                host_query(),
                {"refId": "B", "bucketAggs": [{"id": "3", "type": "date_histogram", "field": "@timestamp"}], "metrics": [{"id": "1", "type": "count"}]},
                {"refId": "C", "bucketAggs": [{"id": "3", "type": "date_histogram"}], "metrics": [{"id": "1", "type": "count"}]}
            ],
            "response": {"responses": [
                {"error": {"reason": "all shards failed", "root_cause": [{"reason": "no such index"}]}},
                {"aggregations": {"3": {"buckets": [{"key": 1000, "doc_count": 2}]}}}
            ]}
        }));

        assert_eq!(response.results["A"].error.as_deref(), Some("no such index"));
        assert_eq!(response.results["B"].error, None);
        assert_eq!(response.results["B"].series[0].name, "Count");
        assert!(response.results["C"].error.is_some());
    }

    #[test]
    fn trims_edges_after_naming() {
        let response = decode(json!({
            "queries": [{
                "refId": "T",
                "bucketAggs": [{"id": "3", "type": "date_histogram", "field": "@timestamp", "settings": {"trimEdges": 1}}],
                "metrics": [{"id": "1", "type": "count"}]
            }],
            "response": {"responses": [{"aggregations": {"3": {"buckets": [
                {"key": 1000, "doc_count": 1},
                {"key": 2000, "doc_count": 2},
                {"key": 3000, "doc_count": 3}
            ]}}}]}
        }));

        let series = &response.results["T"].series[0];
        assert_eq!(series.points.len(), 1);
        assert_eq!(series.points[0].value, Some(2.0));
    }

    #[test]
    fn top_level_error_fails_the_whole_decode() {
        let err = engine()
            .decode(DecodeRequest {
                queries: Vec::new(),
                response: json!({"error": {"reason": "unauthorized"}}),
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::Engine(reason) if reason == "unauthorized"));
    }
}
