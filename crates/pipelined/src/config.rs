//! Daemon configuration.
//!
//! Loaded once at startup into an immutable struct that is passed down;
//! precedence is CLI flags > `--config` TOML file > built-in defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which state backend the controller persists into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Process-local state; for development and tests.
    Memory,
    /// Cluster KV variables; survives controller restarts.
    Cluster,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP API bind address.
    pub http_addr: String,
    /// Runner RPC bind address.
    pub rpc_addr: String,
    /// RPC address advertised to runner containers, when the bind
    /// address is not reachable from the cluster.
    pub rpc_advertise_addr: Option<String>,
    /// Root data directory; run logs live under `<data_dir>/runs`.
    pub data_dir: PathBuf,
    pub cluster: ClusterConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Base URL of the cluster scheduler API.
    pub addr: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackend,
    /// Serve reads from a local cache hydrated at startup. Only
    /// meaningful for the cluster backend.
    pub cache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
            rpc_addr: "127.0.0.1:8181".to_string(),
            rpc_advertise_addr: None,
            data_dir: default_data_dir(),
            cluster: ClusterConfig::default(),
            state: StateConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:4646".to_string(),
            token: None,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Memory,
            cache: true,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pipelined")
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// The RPC address handed to runner containers.
    pub fn advertised_rpc_addr(&self) -> &str {
        self.rpc_advertise_addr.as_deref().unwrap_or(&self.rpc_addr)
    }
}
