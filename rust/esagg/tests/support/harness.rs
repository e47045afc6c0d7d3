use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use esagg::{config::AppConfig, server::Server};
use serde_json::Value;
use std::sync::Once;
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

/// In-process router configured the way a deployment against a single
/// `logs-*` index would be.
#[derive(Clone)]
pub struct EsaggTestHarness {
    router: Router,
}

impl EsaggTestHarness {
    pub fn new() -> Self {
        TRACING_INIT.call_once(|| {
            let _ = tracing_subscriber::fmt::try_init();
        });

        let config = AppConfig {
            api_key: Some(API_KEY.to_string()),
            index: "logs-*".to_string(),
            ..AppConfig::default()
        };

        Self {
            router: Server::new(config).router(),
        }
    }

    pub async fn translate(&self, payload: &Value) -> http::Response<Body> {
        self.request("POST", "/api/translate", Some(payload), true).await
    }

    pub async fn decode(&self, payload: &Value) -> http::Response<Body> {
        self.request("POST", "/api/decode", Some(payload), true).await
    }

    pub async fn translate_without_api_key(&self, payload: &Value) -> http::Response<Body> {
        self.request("POST", "/api/translate", Some(payload), false).await
    }

    pub async fn health(&self) -> http::Response<Body> {
        self.request("GET", "/healthz", None, false).await
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        payload: Option<&Value>,
        include_api_key: bool,
    ) -> http::Response<Body> {
        let mut builder = Request::builder().method(method).uri(path);

        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }

        let body = match payload {
            Some(payload) => {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(payload).expect("request payload should serialize"))
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
