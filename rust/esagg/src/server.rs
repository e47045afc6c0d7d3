use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    query::{DecodeRequest, DecodeResponse, QueryEngine, TranslateRequest, TranslateResponse},
    state::AppState,
};
use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub fn new(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let query = QueryEngine::new(Arc::clone(&config));
        let state = AppState::new(Arc::clone(&config), query);

        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/translate", post(Self::translate))
            .route("/api/decode", post(Self::decode))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(
            %addr,
            flavor = ?self.config.engine_flavor,
            version = %self.config.engine_version,
            "esagg listening"
        );
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn translate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<TranslateRequest>,
    ) -> Result<Json<TranslateResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let response = state.query.translate(request)?;
        Ok(Json(response))
    }

    async fn decode(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<DecodeRequest>,
    ) -> Result<Json<DecodeResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let response = state.query.decode(request)?;
        Ok(Json(response))
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
