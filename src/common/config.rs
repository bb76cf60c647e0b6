//! Configuration for distsync components
//!
//! Values come from (lowest to highest priority): built-in defaults, an
//! optional `distsync.toml`, `DISTSYNC__*` environment variables, and
//! finally whatever the binaries override from their command line.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default chunk size: 4 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator-specific config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Storage node config
    #[serde(default)]
    pub node: NodeConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load `distsync.toml` (if present) and `DISTSYNC__*` overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Same as [`Config::load`] with an explicit file that must exist.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("distsync").required(false)),
        };
        let settings = builder
            .add_source(
                config::Environment::with_prefix("DISTSYNC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// Directory holding `metadata.json`
    pub data_dir: PathBuf,

    /// Replication factor (R)
    pub replicas: usize,

    /// Write quorum (W); defaults to R
    pub write_quorum: Option<usize>,

    /// Accept chunks with fewer than R live candidates as long as W are live
    pub allow_under_replication: bool,

    /// Fixed chunk size in bytes
    pub chunk_size: usize,

    /// Virtual nodes per storage node on the ring
    pub virtual_nodes: usize,

    /// Chunks replicated concurrently within one upload
    pub pipeline_depth: usize,

    /// No heartbeat for this long marks a node non-live
    pub heartbeat_timeout_ms: u64,

    /// Interval nodes are asked to heartbeat at
    pub heartbeat_interval_ms: u64,

    /// Bound on a single replica read or write
    pub replica_timeout_ms: u64,

    /// How often the liveness monitor re-evaluates node states
    pub monitor_interval_ms: u64,

    /// Delay before chunks of a replaced record are deleted
    pub gc_grace_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            data_dir: PathBuf::from("./coord-data"),
            replicas: 2,
            write_quorum: None,
            allow_under_replication: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            virtual_nodes: 128,
            pipeline_depth: 4,
            heartbeat_timeout_ms: 10_000,
            heartbeat_interval_ms: 3_000,
            replica_timeout_ms: 30_000,
            monitor_interval_ms: 1_000,
            gc_grace_ms: 30_000,
        }
    }
}

impl CoordinatorConfig {
    /// Effective write quorum, clamped to `1..=replicas`
    pub fn write_quorum(&self) -> usize {
        self.write_quorum
            .unwrap_or(self.replicas)
            .clamp(1, self.replicas.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn replica_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn gc_grace(&self) -> Duration {
        Duration::from_millis(self.gc_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replicas == 0 {
            return Err(Error::InvalidConfig("replicas must be at least 1".into()));
        }
        if let Some(w) = self.write_quorum {
            if w == 0 || w > self.replicas {
                return Err(Error::InvalidConfig(format!(
                    "write_quorum must be in 1..={}, got {}",
                    self.replicas, w
                )));
            }
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.virtual_nodes == 0 {
            return Err(Error::InvalidConfig(
                "virtual_nodes must be positive".into(),
            ));
        }
        if self.heartbeat_timeout_ms == 0 || self.replica_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identifier
    pub node_id: String,

    /// Bind address for the node HTTP API
    pub bind_addr: SocketAddr,

    /// URL the coordinator should use to reach this node
    pub advertise_url: Option<String>,

    /// Coordinator base URL
    pub coordinator_url: String,

    /// Directory for chunk files
    pub data_dir: PathBuf,

    /// Bytes this node may hold (0 = unlimited)
    pub capacity_bytes: u64,

    /// Largest chunk body accepted
    pub max_chunk_bytes: usize,

    /// Heartbeat period
    pub heartbeat_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 6000)),
            advertise_url: None,
            coordinator_url: "http://127.0.0.1:5000".to_string(),
            data_dir: PathBuf::from("./node-data"),
            capacity_bytes: 0,
            max_chunk_bytes: 64 * 1024 * 1024,
            heartbeat_interval_ms: 3_000,
        }
    }
}

impl NodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// URL advertised to the coordinator, derived from the bind address
    /// when not set explicitly.
    pub fn advertised_url(&self) -> String {
        self.advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind_addr))
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_coordinator_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.replicas, 2);
        assert_eq!(config.write_quorum(), 2);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_write_quorum_validation() {
        let mut config = CoordinatorConfig {
            write_quorum: Some(3),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.write_quorum = Some(1);
        assert!(config.validate().is_ok());
        assert_eq!(config.write_quorum(), 1);

        config.write_quorum = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let config = CoordinatorConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n\n[coordinator]\nreplicas = 3\nchunk_size = 1024\n\n[node]\nnode_id = \"n7\""
        )
        .unwrap();

        let config = Config::load_from(Some(file.path())).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.coordinator.replicas, 3);
        assert_eq!(config.coordinator.chunk_size, 1024);
        assert_eq!(config.coordinator.virtual_nodes, 128);
        assert_eq!(config.node.node_id, "n7");
    }

    #[test]
    fn test_node_advertised_url() {
        let config = NodeConfig::default();
        assert_eq!(config.advertised_url(), "http://127.0.0.1:6000");

        let config = NodeConfig {
            advertise_url: Some("http://storage-3:6000".into()),
            ..Default::default()
        };
        assert_eq!(config.advertised_url(), "http://storage-3:6000");
    }
}
