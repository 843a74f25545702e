//! Configuration module for the distributor
//!
//! Supports YAML configuration files with section-based organization

use serde::{Deserialize, Serialize};
use std::time::Duration;

use bucket_core::{BucketId, DiskIndex, MAX_USED_BITS};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Distributor identity and bucket region
    #[serde(default)]
    pub distributor: DistributorSection,
    /// Storage cluster layout
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Maintenance thresholds and pass timing
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Task executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Diagnostics HTTP API (optional)
    #[serde(default)]
    pub http: Option<HttpConfig>,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            distributor: DistributorSection::default(),
            cluster: ClusterConfig::default(),
            maintenance: MaintenanceConfig::default(),
            executor: ExecutorConfig::default(),
            http: None,
            log: LogConfig::default(),
        }
    }
}

impl DistributorConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: DistributorConfig) {
        self.distributor.merge(other.distributor);
        self.cluster.merge(other.cluster);
        self.maintenance.merge(other.maintenance);
        self.executor.merge(other.executor);
        if other.http.is_some() {
            self.http = other.http;
        }
        self.log.merge(other.log);
    }

    /// Reject settings the maintenance core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.cluster.node_count == 0 {
            return invalid("cluster.node_count must be at least 1".to_string());
        }
        if self.cluster.disks_per_node == 0 || self.cluster.disks_per_node >= DiskIndex::UNASSIGNED_RAW {
            return invalid(format!(
                "cluster.disks_per_node must be in 1..{}",
                DiskIndex::UNASSIGNED_RAW
            ));
        }
        if self.cluster.redundancy == 0 {
            return invalid("cluster.redundancy must be at least 1".to_string());
        }
        if self.executor.lanes == 0 {
            return invalid("executor.lanes must be at least 1".to_string());
        }
        let m = &self.maintenance;
        if m.join_document_count >= m.split_document_count {
            return invalid(format!(
                "maintenance.join_document_count ({}) must be below split_document_count ({})",
                m.join_document_count, m.split_document_count
            ));
        }
        if m.join_total_size >= m.split_total_size {
            return invalid(format!(
                "maintenance.join_total_size ({}) must be below split_total_size ({})",
                m.join_total_size, m.split_total_size
            ));
        }
        if !(m.gc_meta_ratio >= 1.0) {
            return invalid(format!(
                "maintenance.gc_meta_ratio ({}) must be at least 1.0",
                m.gc_meta_ratio
            ));
        }
        if m.min_used_bits > MAX_USED_BITS {
            return invalid(format!(
                "maintenance.min_used_bits ({}) exceeds {}",
                m.min_used_bits, MAX_USED_BITS
            ));
        }
        if m.pass_interval_ms == 0 {
            return invalid("maintenance.pass_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// Distributor identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorSection {
    /// Distributor index, used to tag logs
    #[serde(default)]
    pub index: u16,
    /// Bucket sub-tree this distributor schedules (whole key-space if unset)
    #[serde(default)]
    pub region: Option<BucketId>,
}

impl Default for DistributorSection {
    fn default() -> Self {
        Self {
            index: 0,
            region: None,
        }
    }
}

impl DistributorSection {
    fn merge(&mut self, other: Self) {
        if other.index > 0 {
            self.index = other.index;
        }
        if other.region.is_some() {
            self.region = other.region;
        }
    }
}

/// Storage cluster layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Storage nodes are indexed `0..node_count`
    #[serde(default = "default_node_count")]
    pub node_count: u16,
    /// Disk slots per storage node
    #[serde(default = "default_disks_per_node")]
    pub disks_per_node: u8,
    /// Desired number of legal replicas per bucket
    #[serde(default = "default_redundancy")]
    pub redundancy: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_count: default_node_count(),
            disks_per_node: default_disks_per_node(),
            redundancy: default_redundancy(),
        }
    }
}

impl ClusterConfig {
    fn merge(&mut self, other: Self) {
        if other.node_count > 0 {
            self.node_count = other.node_count;
        }
        if other.disks_per_node > 0 {
            self.disks_per_node = other.disks_per_node;
        }
        if other.redundancy > 0 {
            self.redundancy = other.redundancy;
        }
    }
}

/// Maintenance thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Split when the document count exceeds this
    #[serde(default = "default_split_document_count")]
    pub split_document_count: u32,
    /// Split when the total document size (bytes) exceeds this
    #[serde(default = "default_split_total_size")]
    pub split_total_size: u64,
    /// Join candidates must hold fewer documents than this
    #[serde(default = "default_join_document_count")]
    pub join_document_count: u32,
    /// Join candidates must be smaller than this (bytes)
    #[serde(default = "default_join_total_size")]
    pub join_total_size: u64,
    /// Garbage collect when meta count exceeds document count by this factor
    #[serde(default = "default_gc_meta_ratio")]
    pub gc_meta_ratio: f64,
    /// Pending merges on a node above which new merges are deprioritized
    #[serde(default = "default_merge_backpressure_ceiling")]
    pub merge_backpressure_ceiling: u64,
    /// Buckets are never joined below this many used bits
    #[serde(default = "default_min_used_bits")]
    pub min_used_bits: u8,
    /// Interval between periodic maintenance passes in milliseconds
    #[serde(default = "default_pass_interval_ms")]
    pub pass_interval_ms: u64,
    /// Wait for dispatched operations before a pass completes
    #[serde(default)]
    pub drain_after_pass: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            split_document_count: default_split_document_count(),
            split_total_size: default_split_total_size(),
            join_document_count: default_join_document_count(),
            join_total_size: default_join_total_size(),
            gc_meta_ratio: default_gc_meta_ratio(),
            merge_backpressure_ceiling: default_merge_backpressure_ceiling(),
            min_used_bits: default_min_used_bits(),
            pass_interval_ms: default_pass_interval_ms(),
            drain_after_pass: false,
        }
    }
}

impl MaintenanceConfig {
    fn merge(&mut self, other: Self) {
        if other.split_document_count > 0 {
            self.split_document_count = other.split_document_count;
        }
        if other.split_total_size > 0 {
            self.split_total_size = other.split_total_size;
        }
        if other.join_document_count > 0 {
            self.join_document_count = other.join_document_count;
        }
        if other.join_total_size > 0 {
            self.join_total_size = other.join_total_size;
        }
        if other.gc_meta_ratio > 0.0 {
            self.gc_meta_ratio = other.gc_meta_ratio;
        }
        if other.merge_backpressure_ceiling > 0 {
            self.merge_backpressure_ceiling = other.merge_backpressure_ceiling;
        }
        if other.min_used_bits > 0 {
            self.min_used_bits = other.min_used_bits;
        }
        if other.pass_interval_ms > 0 {
            self.pass_interval_ms = other.pass_interval_ms;
        }
        if other.drain_after_pass {
            self.drain_after_pass = true;
        }
    }

    /// Get pass interval as Duration
    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Number of execution lanes
    #[serde(default = "default_lanes")]
    pub lanes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
        }
    }
}

impl ExecutorConfig {
    fn merge(&mut self, other: Self) {
        if other.lanes > 0 {
            self.lanes = other.lanes;
        }
    }
}

/// Diagnostics HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP API listen address
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
        }
    }
}

// Default value functions

fn default_node_count() -> u16 {
    8
}

fn default_disks_per_node() -> u8 {
    1
}

fn default_redundancy() -> u32 {
    3
}

fn default_split_document_count() -> u32 {
    1000
}

fn default_split_total_size() -> u64 {
    32 * 1024 * 1024 // 32MB
}

fn default_join_document_count() -> u32 {
    500
}

fn default_join_total_size() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_gc_meta_ratio() -> f64 {
    2.0
}

fn default_merge_backpressure_ceiling() -> u64 {
    10
}

fn default_min_used_bits() -> u8 {
    16
}

fn default_pass_interval_ms() -> u64 {
    1000 // 1 second
}

fn default_lanes() -> usize {
    8
}

fn default_http_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
