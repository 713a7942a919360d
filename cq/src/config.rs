//! clusterquery configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Query behaviour
    pub query: QueryConfig,

    /// In-process cluster simulation
    pub simulation: SimulationConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .clusterquery.yml
        let local_config = PathBuf::from(".clusterquery.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/clusterquery/clusterquery.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("clusterquery").join("clusterquery.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is initialized
    ///
    /// Errors are swallowed; the full load reports them later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Query behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long `gather` waits for responses
    #[serde(rename = "gather-timeout-ms")]
    pub gather_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { gather_timeout_ms: 1000 }
    }
}

impl QueryConfig {
    pub fn gather_timeout(&self) -> Duration {
        debug!(gather_timeout_ms = %self.gather_timeout_ms, "QueryConfig::gather_timeout: called");
        Duration::from_millis(self.gather_timeout_ms)
    }
}

/// In-process cluster simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of nodes, including the one issuing the query
    pub peers: usize,

    /// Nodes that register no handler and never answer
    #[serde(rename = "silent-peers")]
    pub silent_peers: usize,

    /// Delay on every link
    #[serde(rename = "latency-ms")]
    pub latency_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            peers: 3,
            silent_peers: 0,
            latency_ms: 0,
        }
    }
}
