pub mod config;
pub mod dialect;
pub mod error;
pub mod index_pattern;
pub mod models;
pub mod query;
pub mod server;
pub mod settings;
pub mod state;
pub mod telemetry;
pub mod time;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the aggregation translator using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).run().await
}
