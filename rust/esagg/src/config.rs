use crate::{
    dialect::{EngineFlavor, EngineVersion},
    index_pattern::IndexInterval,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    pub engine_flavor: EngineFlavor,
    pub engine_version: EngineVersion,
    pub index: String,
    pub index_interval: Option<IndexInterval>,
    pub time_field: String,
    pub max_concurrent_shard_requests: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    esagg_listen_addr: Option<String>,
    #[serde(default)]
    esagg_listen_host: Option<String>,
    #[serde(default)]
    esagg_listen_port: Option<u16>,
    #[serde(default)]
    esagg_api_key: Option<String>,
    #[serde(default)]
    esagg_engine_flavor: Option<String>,
    #[serde(default)]
    esagg_engine_version: Option<String>,
    #[serde(default)]
    esagg_index: Option<String>,
    #[serde(default)]
    esagg_index_interval: Option<String>,
    #[serde(default = "default_time_field")]
    esagg_time_field: String,
    #[serde(default)]
    esagg_max_concurrent_shard_requests: Option<i64>,
}

fn default_time_field() -> String {
    "@timestamp".to_string()
}

const fn default_port() -> u16 {
    8490
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse ESAGG_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.esagg_listen_addr,
            raw.esagg_listen_host,
            raw.esagg_listen_port,
        )?;

        let engine_flavor = raw
            .esagg_engine_flavor
            .as_deref()
            .map(str::parse::<EngineFlavor>)
            .transpose()
            .context("invalid ESAGG_ENGINE_FLAVOR value")?
            .unwrap_or_default();

        let engine_version = raw
            .esagg_engine_version
            .as_deref()
            .map(str::parse::<EngineVersion>)
            .transpose()
            .context("invalid ESAGG_ENGINE_VERSION value")?
            .unwrap_or_default();

        let index_interval = raw
            .esagg_index_interval
            .as_deref()
            .map(str::trim)
            .filter(|interval| !interval.is_empty())
            .map(str::parse::<IndexInterval>)
            .transpose()
            .context("invalid ESAGG_INDEX_INTERVAL value")?;

        let max_concurrent_shard_requests = raw
            .esagg_max_concurrent_shard_requests
            .filter(|limit| *limit > 0);

        Ok(Self {
            listen_addr,
            api_key: raw.esagg_api_key.filter(|key| !key.is_empty()),
            engine_flavor,
            engine_version,
            index: raw.esagg_index.unwrap_or_default(),
            index_interval,
            time_field: raw.esagg_time_field,
            max_concurrent_shard_requests,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], default_port())),
            api_key: None,
            engine_flavor: EngineFlavor::default(),
            engine_version: EngineVersion::default(),
            index: String::new(),
            index_interval: None,
            time_field: default_time_field(),
            max_concurrent_shard_requests: None,
        }
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid ESAGG_LISTEN_ADDR value")?
            .next()
            .context("ESAGG_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(default_port());
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid ESAGG listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
