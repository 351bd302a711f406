//! Configuration schema and loader for ringkv nodes.

use ringkv_common::NodeId;
use ringkv_kv::{CoordinatorConfig, ReplicationParams};
use ringkv_storage::{EngineOptions, FsyncPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's listen address.
    pub listen: SocketAddr,

    /// This node's identity in the topology. Defaults to `http://<listen>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,

    /// Every cluster member, this node included.
    #[serde(default)]
    pub topology: Vec<NodeId>,

    /// Default N/R/W. Defaults to N = |topology|, R = W = N/2 + 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationParams>,

    /// Deadline for a single replica call, in milliseconds.
    #[serde(default = "default_replica_timeout_ms")]
    pub replica_timeout_ms: u64,

    /// Whether read-repair is enabled.
    #[serde(default = "default_true")]
    pub read_repair: bool,

    /// Ring positions per node.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for WAL, segments and MANIFEST.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,

    /// Flush the memtable to a segment at this size.
    #[serde(default = "default_memtable_flush_bytes")]
    pub memtable_flush_bytes: usize,

    /// Compact once this many segments exist.
    #[serde(default = "default_compaction_trigger_segments")]
    pub compaction_trigger_segments: usize,

    /// How often the background task checks for compaction, in seconds.
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,

    /// How long tombstones survive compaction, in seconds.
    #[serde(default = "default_tombstone_grace_secs")]
    pub tombstone_grace_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
            memtable_flush_bytes: default_memtable_flush_bytes(),
            compaction_trigger_segments: default_compaction_trigger_segments(),
            compaction_interval_secs: default_compaction_interval_secs(),
            tombstone_grace_secs: default_tombstone_grace_secs(),
        }
    }
}

// --- Defaults ---

fn default_replica_timeout_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_virtual_nodes() -> usize {
    ringkv_kv::router::DEFAULT_VIRTUAL_NODES
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}
fn default_memtable_flush_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_compaction_trigger_segments() -> usize {
    4
}
fn default_compaction_interval_secs() -> u64 {
    30
}
fn default_tombstone_grace_secs() -> u64 {
    24 * 60 * 60
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    pub fn local_id(&self) -> NodeId {
        self.node_id
            .clone()
            .unwrap_or_else(|| NodeId::from_addr(self.listen))
    }

    /// The configured replication, or the majority default for the topology.
    pub fn replication(&self) -> ReplicationParams {
        self.replication
            .unwrap_or_else(|| ReplicationParams::default_for(self.topology.len()))
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            replication: self.replication(),
            replica_timeout: Duration::from_millis(self.replica_timeout_ms),
            read_repair: self.read_repair,
        }
    }

    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.is_empty() {
            return Err(ConfigError::Invalid("topology must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for node in &self.topology {
            if !seen.insert(node) {
                return Err(ConfigError::Invalid(format!(
                    "topology lists {} more than once",
                    node
                )));
            }
        }
        let local_id = self.local_id();
        if !seen.contains(&local_id) {
            return Err(ConfigError::Invalid(format!(
                "node_id {} is not in the topology",
                local_id
            )));
        }
        self.replication()
            .validate(self.topology.len())
            .map_err(|e| ConfigError::Invalid(format!("replication: {}", e)))?;
        if self.replica_timeout_ms == 0 {
            return Err(ConfigError::Invalid("replica_timeout_ms must be > 0".into()));
        }
        if self.virtual_nodes == 0 {
            return Err(ConfigError::Invalid("virtual_nodes must be > 0".into()));
        }
        self.storage.validate()
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !["always", "batch", "none"].contains(&self.fsync.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "storage.fsync must be always, batch or none, got {:?}",
                self.fsync
            )));
        }
        if self.memtable_flush_bytes == 0 {
            return Err(ConfigError::Invalid(
                "storage.memtable_flush_bytes must be > 0".into(),
            ));
        }
        if self.compaction_trigger_segments < 2 {
            return Err(ConfigError::Invalid(
                "storage.compaction_trigger_segments must be >= 2".into(),
            ));
        }
        if self.compaction_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "storage.compaction_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            fsync: FsyncPolicy::from_str_config(&self.fsync),
            memtable_flush_bytes: self.memtable_flush_bytes,
            tombstone_grace: Duration::from_secs(self.tombstone_grace_secs),
        }
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
