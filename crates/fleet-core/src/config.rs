//! fleet.toml node configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HostAndPort, NodeDescriptor};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Memory this node may reserve for workers (MiB).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Control loop ticks per second.
    #[serde(default = "default_tps")]
    pub tps: u32,
    /// Directory holding the persistent state store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Timeout for forwarded request/response exchanges.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub id: String,
    pub listeners: Vec<HostAndPort>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Shared secret every node and worker presents during the handshake.
    #[serde(default)]
    pub secret: String,
    /// Configured peers.
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// CA every peer and worker certificate must chain to.
    pub ca: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// First port handed out to workers without an explicit port.
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    /// Parent directory of per-worker working directories.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Grace period between a stop command and a forced kill.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Console lines retained per worker.
    #[serde(default = "default_log_cache_lines")]
    pub log_cache_lines: usize,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            start_port: default_start_port(),
            working_dir: default_working_dir(),
            stop_timeout_ms: default_stop_timeout_ms(),
            log_cache_lines: default_log_cache_lines(),
        }
    }
}

fn default_max_memory_mb() -> u64 {
    2048
}

fn default_tps() -> u32 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_rpc_timeout_ms() -> u64 {
    5_000
}

fn default_start_port() -> u16 {
    44955
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("temp/services")
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

fn default_log_cache_lines() -> usize {
    64
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a single-node configuration listening on `0.0.0.0:1410`.
    pub fn scaffold(id: &str) -> Self {
        NodeConfig {
            max_memory_mb: default_max_memory_mb(),
            tps: default_tps(),
            data_dir: default_data_dir(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            identity: IdentityConfig {
                id: id.to_string(),
                listeners: vec![HostAndPort::new("0.0.0.0", 1410)],
            },
            cluster: ClusterConfig {
                secret: "change-me".to_string(),
                nodes: Vec::new(),
            },
            tls: TlsConfig::default(),
            services: ServicesConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.id.trim().is_empty() {
            return Err(ConfigError::Invalid("identity.id must not be empty".into()));
        }
        if self.identity.listeners.is_empty() {
            return Err(ConfigError::Invalid(
                "identity.listeners must name at least one address".into(),
            ));
        }
        if self.tps == 0 {
            return Err(ConfigError::Invalid("tps must be greater than zero".into()));
        }
        if self.tps > 1_000 {
            return Err(ConfigError::Invalid("tps must not exceed 1000".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.cluster.nodes {
            if peer.id == self.identity.id {
                return Err(ConfigError::Invalid(format!(
                    "cluster.nodes contains the local node id '{}'",
                    peer.id
                )));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate peer id '{}'",
                    peer.id
                )));
            }
            if peer.listeners.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "peer '{}' has no listeners",
                    peer.id
                )));
            }
        }

        if self.tls.enabled
            && (self.tls.cert.is_none() || self.tls.key.is_none() || self.tls.ca.is_none())
        {
            return Err(ConfigError::Invalid(
                "tls.enabled requires tls.cert, tls.key and tls.ca".into(),
            ));
        }
        Ok(())
    }

    pub fn local_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.identity.id.clone(),
            listeners: self.identity.listeners.clone(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(1_000 / u64::from(self.tps.max(1)))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.services.stop_timeout_ms)
    }
}
