use crate::{config::AppConfig, query::QueryEngine};
use std::sync::Arc;

/// Handler state: the service configuration and the translate/decode engine.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub query: QueryEngine,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, query: QueryEngine) -> Self {
        Self { config, query }
    }
}
