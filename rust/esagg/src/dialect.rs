//! Engine family and version rules that shape the generated request.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

const DEFAULT_HEADER_SHARD_REQUESTS: i64 = 256;
const DEFAULT_PARAM_SHARD_REQUESTS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFlavor {
    #[default]
    Elasticsearch,
    #[serde(alias = "open_search")]
    OpenSearch,
}

impl FromStr for EngineFlavor {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "elasticsearch" | "es" => Ok(Self::Elasticsearch),
            "opensearch" | "open_search" => Ok(Self::OpenSearch),
            other => Err(ServiceError::Config(format!(
                "unknown engine flavor '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EngineVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl EngineVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Default for EngineVersion {
    fn default() -> Self {
        Self::new(7, 10, 0)
    }
}

impl FromStr for EngineVersion {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_start_matches('v');
        // Pre-release and build suffixes (`8.1.0-SNAPSHOT`) do not affect dialect rules.
        let core = trimmed
            .split(|ch: char| ch == '-' || ch == '+')
            .next()
            .unwrap_or_default();

        let mut parts = core.split('.');
        let mut next = |required: bool| -> Result<u64, ServiceError> {
            match parts.next() {
                Some(part) => part.parse::<u64>().map_err(|_| {
                    ServiceError::Config(format!("invalid engine version '{value}'"))
                }),
                None if required => Err(ServiceError::Config(format!(
                    "invalid engine version '{value}'"
                ))),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        Ok(Self::new(major, minor, patch))
    }
}

impl TryFrom<String> for EngineVersion {
    type Error = ServiceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EngineVersion> for String {
    fn from(version: EngineVersion) -> Self {
        version.to_string()
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Where the `max_concurrent_shard_requests` limit travels in a multi-search call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRequestLimit {
    Header(i64),
    QueryParam(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dialect {
    pub flavor: EngineFlavor,
    pub version: EngineVersion,
}

impl Dialect {
    pub fn new(flavor: EngineFlavor, version: EngineVersion) -> Self {
        Self { flavor, version }
    }

    fn is_opensearch(&self) -> bool {
        matches!(self.flavor, EngineFlavor::OpenSearch)
    }

    /// Terms ordering on `_term` is spelled `_key` from Elasticsearch 6 on.
    pub fn renames_term_order(&self) -> bool {
        self.is_opensearch() || self.version.major >= 6
    }

    /// Date histograms take `fixed_interval` instead of `interval` from Elasticsearch 7 on.
    pub fn uses_fixed_interval(&self) -> bool {
        self.is_opensearch() || self.version.major >= 7
    }

    pub fn uses_docvalue_fields(&self) -> bool {
        self.is_opensearch() || self.version.major >= 5
    }

    pub fn search_type(&self) -> &'static str {
        if !self.is_opensearch() && self.version.major < 5 {
            "count"
        } else {
            "query_then_fetch"
        }
    }

    pub fn shard_request_limit(&self, configured: Option<i64>) -> Option<ShardRequestLimit> {
        if self.is_opensearch() || self.version.major >= 7 {
            return Some(ShardRequestLimit::QueryParam(
                configured.unwrap_or(DEFAULT_PARAM_SHARD_REQUESTS),
            ));
        }

        if self.version >= EngineVersion::new(5, 6, 0) {
            return Some(ShardRequestLimit::Header(
                configured.unwrap_or(DEFAULT_HEADER_SHARD_REQUESTS),
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elastic(version: &str) -> Dialect {
        Dialect::new(EngineFlavor::Elasticsearch, version.parse().unwrap())
    }

    #[test]
    fn parses_versions_with_suffixes() {
        assert_eq!(
            "8.1.0-SNAPSHOT".parse::<EngineVersion>().unwrap(),
            EngineVersion::new(8, 1, 0)
        );
        assert_eq!(
            "7".parse::<EngineVersion>().unwrap(),
            EngineVersion::new(7, 0, 0)
        );
        assert!("seven".parse::<EngineVersion>().is_err());
    }

    #[test]
    fn shard_request_limit_follows_version_table() {
        assert_eq!(elastic("5.5.0").shard_request_limit(None), None);
        assert_eq!(
            elastic("5.6.0").shard_request_limit(None),
            Some(ShardRequestLimit::Header(256))
        );
        assert_eq!(
            elastic("6.8.2").shard_request_limit(Some(42)),
            Some(ShardRequestLimit::Header(42))
        );
        assert_eq!(
            elastic("7.0.0").shard_request_limit(None),
            Some(ShardRequestLimit::QueryParam(5))
        );

        let opensearch = Dialect::new(EngineFlavor::OpenSearch, EngineVersion::new(1, 3, 0));
        assert_eq!(
            opensearch.shard_request_limit(None),
            Some(ShardRequestLimit::QueryParam(5))
        );
    }

    #[test]
    fn term_order_rename_and_fixed_interval() {
        assert!(!elastic("5.6.0").renames_term_order());
        assert!(elastic("6.0.0").renames_term_order());
        assert!(!elastic("6.8.0").uses_fixed_interval());
        assert!(elastic("7.10.0").uses_fixed_interval());

        let opensearch = Dialect::new(EngineFlavor::OpenSearch, EngineVersion::new(1, 0, 0));
        assert!(opensearch.renames_term_order());
        assert!(opensearch.uses_fixed_interval());
    }

    #[test]
    fn legacy_versions_use_count_search_type() {
        assert_eq!(elastic("2.4.0").search_type(), "count");
        assert_eq!(elastic("5.0.0").search_type(), "query_then_fetch");
    }
}
