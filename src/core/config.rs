//! Configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file with CLI overrides. Every section
//! has defaults, so an empty file describes a standalone node backed by the
//! durable store in `./data`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity advertised to the cluster.
    #[serde(default)]
    pub node: NodeConfig,

    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Queue engine tuning.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Cluster coordination configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Node identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address other nodes and operators reach this node at.
    #[serde(default = "default_node_ip")]
    pub ip: String,

    /// Port the front end listens on.
    #[serde(default = "default_node_port")]
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip: default_node_ip(),
            port: default_node_port(),
        }
    }
}

/// Storage backend variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Write-ahead log on disk.
    Durable,
    /// Volatile in-memory map.
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Durable => write!(f, "durable"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend variant.
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Directory for the durable backend.
    #[serde(default = "default_storage_dir")]
    pub dir: String,

    /// Durability mode: "strict" or "group-fsync".
    #[serde(default = "default_durability_mode")]
    pub durability_mode: String,

    /// Segment rotation size in bytes.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,

    /// Log size below which compaction never runs.
    #[serde(default = "default_compaction_min_bytes")]
    pub compaction_min_bytes: u64,

    /// Fraction of dead bytes in the log that triggers compaction.
    #[serde(default = "default_compaction_garbage_ratio")]
    pub compaction_garbage_ratio: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            dir: default_storage_dir(),
            durability_mode: default_durability_mode(),
            segment_max_bytes: default_segment_max_bytes(),
            compaction_min_bytes: default_compaction_min_bytes(),
            compaction_garbage_ratio: default_compaction_garbage_ratio(),
        }
    }
}

impl StorageConfig {
    /// Volatile storage, for tests and ephemeral nodes.
    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            ..Default::default()
        }
    }

    /// Durable storage rooted at `dir`.
    pub fn durable(dir: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Durable,
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Whether every write is fsynced before returning.
    pub fn is_strict(&self) -> bool {
        self.durability_mode == "strict"
    }
}

/// Queue engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Recycle scheduler period in milliseconds.
    #[serde(default = "default_recycle_tick_ms")]
    pub recycle_tick_ms: u64,

    /// Largest accepted payload in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            recycle_tick_ms: default_recycle_tick_ms(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl QueueConfig {
    /// Recycle scheduler period.
    pub fn recycle_tick(&self) -> Duration {
        Duration::from_millis(self.recycle_tick_ms)
    }
}

/// Cluster coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, used as the coordination namespace.
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Coordination service (etcd) endpoints. Empty means standalone.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Heartbeat and peer refresh interval in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat age after which a peer is considered gone.
    #[serde(default = "default_peer_ttl_ms")]
    pub peer_ttl_ms: u64,

    /// Per-request timeout against the coordination service.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            endpoints: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            peer_ttl_ms: default_peer_ttl_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ClusterConfig {
    /// Whether a coordination service is configured.
    pub fn is_clustered(&self) -> bool {
        !self.endpoints.is_empty()
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_node_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_node_port() -> u16 {
    8808
}

fn default_backend() -> StorageBackend {
    StorageBackend::Durable
}

fn default_storage_dir() -> String {
    "data".to_string()
}

fn default_durability_mode() -> String {
    "strict".to_string()
}

fn default_segment_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_compaction_min_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_compaction_garbage_ratio() -> f64 {
    0.5
}

fn default_recycle_tick_ms() -> u64 {
    1_000
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_cluster_name() -> String {
    "linemq".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_peer_ttl_ms() -> u64 {
    15_000
}

fn default_request_timeout_ms() -> u64 {
    3_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref storage_dir) = overrides.storage_dir {
            self.storage.dir = storage_dir.clone();
        }
        if let Some(backend) = overrides.backend {
            self.storage.backend = backend;
        }
        if let Some(port) = overrides.port {
            self.node.port = port;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_node()?;
        self.validate_storage()?;
        self.validate_queue()?;
        self.validate_cluster()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        if self.node.ip.trim().is_empty() {
            anyhow::bail!("node.ip must not be empty");
        }
        if self.node.port == 0 {
            anyhow::bail!("node.port must be > 0");
        }
        Ok(())
    }

    fn validate_storage(&self) -> Result<()> {
        if self.storage.durability_mode != "strict"
            && self.storage.durability_mode != "group-fsync"
        {
            anyhow::bail!(
                "storage.durability_mode must be 'strict' or 'group-fsync', got: {}",
                self.storage.durability_mode
            );
        }

        if self.storage.backend == StorageBackend::Durable && self.storage.dir.trim().is_empty() {
            anyhow::bail!("storage.dir required for the durable backend");
        }

        if self.storage.segment_max_bytes < 4096 {
            anyhow::bail!(
                "storage.segment_max_bytes must be at least 4096, got: {}",
                self.storage.segment_max_bytes
            );
        }

        let ratio = self.storage.compaction_garbage_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            anyhow::bail!(
                "storage.compaction_garbage_ratio must be between 0 and 1, got: {}",
                ratio
            );
        }

        Ok(())
    }

    fn validate_queue(&self) -> Result<()> {
        if self.queue.recycle_tick_ms == 0 {
            anyhow::bail!("queue.recycle_tick_ms must be > 0");
        }
        if self.queue.max_payload_bytes == 0 {
            anyhow::bail!("queue.max_payload_bytes must be > 0");
        }
        Ok(())
    }

    fn validate_cluster(&self) -> Result<()> {
        if self.cluster.name.is_empty() || self.cluster.name.contains('/') {
            anyhow::bail!(
                "cluster.name must be non-empty and must not contain '/', got: {:?}",
                self.cluster.name
            );
        }

        if self.cluster.heartbeat_interval_ms == 0 {
            anyhow::bail!("cluster.heartbeat_interval_ms must be > 0");
        }

        // A peer must survive at least one missed heartbeat.
        if self.cluster.peer_ttl_ms <= self.cluster.heartbeat_interval_ms {
            anyhow::bail!(
                "cluster.peer_ttl_ms ({}) must exceed cluster.heartbeat_interval_ms ({})",
                self.cluster.peer_ttl_ms,
                self.cluster.heartbeat_interval_ms
            );
        }

        if self.cluster.request_timeout_ms == 0 {
            anyhow::bail!("cluster.request_timeout_ms must be > 0");
        }

        if let Some(empty) = self.cluster.endpoints.iter().find(|e| e.trim().is_empty()) {
            anyhow::bail!("cluster.endpoints contains an empty entry: {:?}", empty);
        }

        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override storage directory.
    pub storage_dir: Option<String>,
    /// Override storage backend.
    pub backend: Option<StorageBackend>,
    /// Override advertised port.
    pub port: Option<u16>,
}
