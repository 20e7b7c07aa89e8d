//! Runtime configuration from `SLOTKEEPER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use ulid::Ulid;

use crate::model::{RequesterId, ResourceId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub request_timeout: Duration,
    pub stats_interval: Duration,
    pub metrics_port: Option<u16>,
    /// Known resources. `None` accepts any resource id.
    pub resources: Option<Vec<ResourceId>>,
    /// Known requesters. `None` accepts any requester id.
    pub requesters: Option<Vec<RequesterId>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            request_timeout: Duration::from_millis(5000),
            stats_interval: Duration::from_secs(30),
            metrics_port: None,
            resources: None,
            requesters: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        Ok(Self {
            bind: get("SLOTKEEPER_BIND").unwrap_or(defaults.bind),
            port: parse_or(&get, "SLOTKEEPER_PORT", defaults.port)?,
            data_dir: get("SLOTKEEPER_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            max_connections: parse_or(&get, "SLOTKEEPER_MAX_CONNECTIONS", defaults.max_connections)?,
            compact_threshold: parse_or(
                &get,
                "SLOTKEEPER_COMPACT_THRESHOLD",
                defaults.compact_threshold,
            )?,
            request_timeout: Duration::from_millis(parse_or(
                &get,
                "SLOTKEEPER_REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )?),
            stats_interval: Duration::from_secs(parse_or(
                &get,
                "SLOTKEEPER_STATS_INTERVAL_SECS",
                defaults.stats_interval.as_secs(),
            )?),
            metrics_port: get("SLOTKEEPER_METRICS_PORT")
                .map(|v| parse_value("SLOTKEEPER_METRICS_PORT", &v))
                .transpose()?,
            resources: get("SLOTKEEPER_RESOURCES")
                .map(|v| parse_ids("SLOTKEEPER_RESOURCES", &v))
                .transpose()?,
            requesters: get("SLOTKEEPER_REQUESTERS")
                .map(|v| parse_ids("SLOTKEEPER_REQUESTERS", &v))
                .transpose()?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(value) => parse_value(var, &value),
        None => Ok(default),
    }
}

fn parse_value<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Comma-separated ULIDs.
fn parse_ids(var: &'static str, value: &str) -> Result<Vec<Ulid>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value(var, s))
        .collect()
}
