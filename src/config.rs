//! Merger configuration file.
//!
//! Stored as JSON on disk:
//! ```json
//! {
//!   "timeout_ms": 1000,
//!   "dispatcher": "broadcast",
//!   "filters": [{ "type": "vehicle_with_no_trip" }],
//!   "sources": [
//!     { "name": "mbta", "url": "https://cdn.mbta.com/realtime/VehiclePositions.pb" }
//!   ],
//!   "sinks": [{ "type": "file", "path": "out/merged.pb" }]
//! }
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::coordinator::{CoordinatorSettings, Dispatcher};
use crate::filter::{FilterChain, FilterConfig};

pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error("poll_interval_secs must be greater than zero for source '{0}'")]
    ZeroPollInterval(String),
    #[error("fetch_timeout_secs must be greater than zero for source '{0}'")]
    ZeroFetchTimeout(String),
    #[error("duplicate source name '{0}'")]
    DuplicateSource(String),
    #[error("at least one source is required")]
    NoSources,
    #[error("at least one sink is required")]
    NoSinks,
}

/// How a source authenticates against its feed endpoint. Keys are read from
/// the named environment variable when the source starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceAuth {
    #[default]
    None,
    Header { header_name: String, key_env: String },
    Bearer { key_env: String },
    UrlParam { param_name: String, key_env: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// `http(s)://` URL or a local file path.
    pub url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default)]
    pub auth: SourceAuth,
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Protobuf feed written atomically to a local path.
    File {
        path: PathBuf,
        #[serde(default)]
        gzip: bool,
    },
    /// Protobuf feed uploaded to S3 on every cycle.
    S3 {
        bucket: String,
        key: String,
        #[serde(default)]
        gzip: bool,
    },
    /// One CSV row of cycle statistics per cycle.
    Stats { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MergerConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub dispatcher: Dispatcher,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_consumer_capacity")]
    pub consumer_capacity: usize,
    pub sources: Vec<SourceConfig>,
    pub sinks: Vec<SinkConfig>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_mailbox_capacity() -> usize {
    CoordinatorSettings::default().mailbox_capacity
}

fn default_consumer_capacity() -> usize {
    CoordinatorSettings::default().consumer_capacity
}

impl MergerConfig {
    /// Loads and validates the config from a JSON file at `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Read { path, source })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: MergerConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.sinks.is_empty() {
            return Err(ConfigError::NoSinks);
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            if source.poll_interval_secs == 0 {
                return Err(ConfigError::ZeroPollInterval(source.name.clone()));
            }
            if source.fetch_timeout_secs == 0 {
                return Err(ConfigError::ZeroFetchTimeout(source.name.clone()));
            }
        }

        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            dispatcher: self.dispatcher,
            mailbox_capacity: self.mailbox_capacity,
            consumer_capacity: self.consumer_capacity,
        }
    }

    pub fn filter_chain(&self) -> FilterChain {
        FilterChain::from_config(&self.filters)
    }
}
