//! Node configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables:
//!
//! - `FOGSYNC_APP`, `FOGSYNC_DEVICE_ID`, `FOGSYNC_LEVEL`
//! - `FOGSYNC_LOCAL_HOST`, `FOGSYNC_LOCAL_PORT`
//! - `FOGSYNC_LOCAL_BATCH_WINDOW_MS`, `FOGSYNC_PARENT_BATCH_WINDOW_MS`, `FOGSYNC_BATCH_MAX_ENTRIES`
//! - `FOGSYNC_HISTORY_LIMIT`, `FOGSYNC_MAX_STREAMS_PER_SOURCE`
//! - `FOGSYNC_RECONNECT_BACKOFF_MS`, `FOGSYNC_RECONNECT_ATTEMPTS`
//! - `FOGSYNC_SENTINEL_HOST`, `FOGSYNC_SENTINEL_PORT`, `FOGSYNC_MASTER_NAME`

use crate::hierarchy::{Level, NodeIdentity};
use crate::transport::AdapterConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    /// Environment override that does not parse
    Invalid { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(msg) => write!(f, "cannot parse config: {}", msg),
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {}: {}", key, value),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Sentinel to watch for `+switch-master`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverConfig {
    pub sentinel_host: String,
    #[serde(default = "default_sentinel_port")]
    pub sentinel_port: u16,
    pub master_name: String,
}

fn default_sentinel_port() -> u16 {
    26379
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub app: String,
    pub device_id: String,
    pub level: Level,
    pub local_host: String,
    pub local_port: u16,
    pub local_batch_window_ms: u64,
    pub parent_batch_window_ms: u64,
    pub batch_max_entries: usize,
    /// Per-channel history cap; oldest entries are evicted first
    pub history_limit: usize,
    pub max_streams_per_source: usize,
    pub reconnect_backoff_ms: u64,
    pub reconnect_attempts: u32,
    pub failover: Option<FailoverConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            app: "app".to_string(),
            device_id: random_device_id(),
            level: Level::Device,
            local_host: "127.0.0.1".to_string(),
            local_port: 6379,
            local_batch_window_ms: 3000,
            parent_batch_window_ms: 3000,
            batch_max_entries: 512,
            history_limit: 1024,
            max_streams_per_source: 4096,
            reconnect_backoff_ms: 1000,
            reconnect_attempts: 5,
            failover: None,
        }
    }
}

fn random_device_id() -> String {
    let id: u64 = rand::thread_rng().gen();
    format!("{:016x}", id)
}

impl NodeConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&text)
    }

    /// File (if given) plus `FOGSYNC_*` overrides from the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (the environment in production)
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("FOGSYNC_APP") {
            self.app = v;
        }
        if let Some(v) = lookup("FOGSYNC_DEVICE_ID") {
            self.device_id = v;
        }
        override_parsed(&lookup, "FOGSYNC_LEVEL", &mut self.level)?;
        if let Some(v) = lookup("FOGSYNC_LOCAL_HOST") {
            self.local_host = v;
        }
        override_parsed(&lookup, "FOGSYNC_LOCAL_PORT", &mut self.local_port)?;
        override_parsed(&lookup, "FOGSYNC_LOCAL_BATCH_WINDOW_MS", &mut self.local_batch_window_ms)?;
        override_parsed(&lookup, "FOGSYNC_PARENT_BATCH_WINDOW_MS", &mut self.parent_batch_window_ms)?;
        override_parsed(&lookup, "FOGSYNC_BATCH_MAX_ENTRIES", &mut self.batch_max_entries)?;
        override_parsed(&lookup, "FOGSYNC_HISTORY_LIMIT", &mut self.history_limit)?;
        override_parsed(&lookup, "FOGSYNC_MAX_STREAMS_PER_SOURCE", &mut self.max_streams_per_source)?;
        override_parsed(&lookup, "FOGSYNC_RECONNECT_BACKOFF_MS", &mut self.reconnect_backoff_ms)?;
        override_parsed(&lookup, "FOGSYNC_RECONNECT_ATTEMPTS", &mut self.reconnect_attempts)?;

        if let (Some(host), Some(name)) = (lookup("FOGSYNC_SENTINEL_HOST"), lookup("FOGSYNC_MASTER_NAME")) {
            let mut failover = FailoverConfig {
                sentinel_host: host,
                sentinel_port: default_sentinel_port(),
                master_name: name,
            };
            override_parsed(&lookup, "FOGSYNC_SENTINEL_PORT", &mut failover.sentinel_port)?;
            self.failover = Some(failover);
        }
        Ok(())
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.app.clone(), self.device_id.clone(), self.level)
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            local_batch_window: Duration::from_millis(self.local_batch_window_ms),
            parent_batch_window: Duration::from_millis(self.parent_batch_window_ms),
            batch_max_entries: self.batch_max_entries,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *target = value.parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}
