//! Configuration parsing and validation.
//!
//! Cache configuration is loaded from TOML files with programmatic overrides.
//! Sections mirror the components they configure: cluster layout, locking,
//! transactions, near-cache (L1), persistence, and telemetry.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster layout and cache mode.
    pub cluster: ClusterConfig,

    /// Lock acquisition settings.
    #[serde(default)]
    pub locking: LockingConfig,

    /// Transaction settings.
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Near-cache (L1) settings.
    #[serde(default)]
    pub l1: L1Config,

    /// Persistence settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Telemetry settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// How data is spread across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Single node, no ownership concept.
    Local,
    /// Every node keeps its own copy; peers are invalidated on write.
    Invalidation,
    /// Every node is an owner of every segment.
    Replicated,
    /// Each segment is owned by `num_owners` nodes.
    Distributed,
    /// Single owner per segment, versioned backups.
    Scattered,
}

impl CacheMode {
    /// Check if this mode involves more than one node.
    pub fn is_clustered(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

/// Which locking strategy the cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Locks live for the duration of a single operation.
    NonTransactional,
    /// Locks are acquired at prepare time, write skew is verified.
    Optimistic,
    /// Locks are acquired eagerly when a key is written.
    Pessimistic,
}

impl TransactionMode {
    pub fn is_transactional(&self) -> bool {
        !matches!(self, Self::NonTransactional)
    }
}

/// Cluster layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's identifier.
    pub node_id: String,

    /// Cache mode.
    pub cache_mode: CacheMode,

    /// Number of hash segments.
    #[serde(default = "default_num_segments")]
    pub num_segments: u32,

    /// Owners per segment in distributed mode.
    #[serde(default = "default_num_owners")]
    pub num_owners: u32,
}

/// Lock acquisition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Lock acquisition timeout in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Isolation level for transactional reads.
    #[serde(default = "default_isolation")]
    pub isolation: IsolationLevel,

    /// Verify at prepare time that read values have not changed.
    #[serde(default = "default_write_skew_check")]
    pub write_skew_check: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
            isolation: default_isolation(),
            write_skew_check: default_write_skew_check(),
        }
    }
}

/// Transaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Locking strategy.
    #[serde(default = "default_transaction_mode")]
    pub mode: TransactionMode,

    /// Return values of writes may be stale; disables read marking.
    #[serde(default)]
    pub unreliable_return_values: bool,

    /// Commit in a single prepare round when possible.
    #[serde(default)]
    pub use_one_phase_commit: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            mode: default_transaction_mode(),
            unreliable_return_values: false,
            use_one_phase_commit: false,
        }
    }
}

/// Near-cache (L1) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1Config {
    /// Keep short-lived copies of keys owned elsewhere.
    #[serde(default)]
    pub enabled: bool,

    /// Lifespan of an L1 entry in milliseconds.
    #[serde(default = "default_l1_lifespan_ms")]
    pub lifespan_ms: u64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            enabled: false,
            lifespan_ms: default_l1_lifespan_ms(),
        }
    }
}

impl L1Config {
    pub fn lifespan(&self) -> Duration {
        Duration::from_millis(self.lifespan_ms)
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Entries live either in memory or in the store, never both.
    #[serde(default)]
    pub passivation: bool,
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

/// Programmatic overrides applied after loading.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub node_id: Option<String>,
    pub log_level: Option<String>,
    pub acquire_timeout_ms: Option<u64>,
    pub transaction_mode: Option<TransactionMode>,
}

// Default value functions

fn default_num_segments() -> u32 {
    256
}

fn default_num_owners() -> u32 {
    2
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_isolation() -> IsolationLevel {
    IsolationLevel::RepeatableRead
}

fn default_write_skew_check() -> bool {
    true
}

fn default_transaction_mode() -> TransactionMode {
    TransactionMode::NonTransactional
}

fn default_l1_lifespan_ms() -> u64 {
    600_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Build a configuration for one node with every other section defaulted.
    pub fn for_node(node_id: impl Into<String>, cache_mode: CacheMode) -> Self {
        Self {
            cluster: ClusterConfig {
                node_id: node_id.into(),
                cache_mode,
                num_segments: default_num_segments(),
                num_owners: default_num_owners(),
            },
            locking: LockingConfig::default(),
            transaction: TransactionConfig::default(),
            l1: L1Config::default(),
            persistence: PersistenceConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

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

    /// Apply overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref node_id) = overrides.node_id {
            self.cluster.node_id = node_id.clone();
        }
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(timeout) = overrides.acquire_timeout_ms {
            self.locking.acquire_timeout_ms = timeout;
        }
        if let Some(mode) = overrides.transaction_mode {
            self.transaction.mode = mode;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_cluster()?;
        self.validate_transaction()?;
        self.validate_l1()?;
        self.validate_telemetry()?;
        Ok(())
    }

    /// Lock acquisition timeout.
    pub fn lock_acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.locking.acquire_timeout_ms)
    }

    /// Whether optimistic reads must be recorded for write-skew detection.
    pub fn tracks_read_versions(&self) -> bool {
        self.locking.isolation == IsolationLevel::RepeatableRead
            && self.locking.write_skew_check
            && !self.transaction.unreliable_return_values
    }

    fn validate_cluster(&self) -> Result<()> {
        if self.cluster.node_id.trim().is_empty() {
            anyhow::bail!("cluster.node_id must not be empty");
        }
        if self.cluster.num_segments == 0 {
            anyhow::bail!("cluster.num_segments must be > 0");
        }
        if self.cluster.num_owners == 0 {
            anyhow::bail!("cluster.num_owners must be >= 1");
        }
        Ok(())
    }

    fn validate_transaction(&self) -> Result<()> {
        if self.cluster.cache_mode == CacheMode::Scattered
            && self.transaction.mode.is_transactional()
        {
            anyhow::bail!(
                "transaction.mode must be 'non_transactional' for scattered caches, got: {:?}",
                self.transaction.mode
            );
        }
        if self.transaction.mode.is_transactional() && self.locking.acquire_timeout_ms == 0 {
            anyhow::bail!("locking.acquire_timeout_ms must be > 0 for transactional caches");
        }
        Ok(())
    }

    fn validate_l1(&self) -> Result<()> {
        if !self.l1.enabled {
            return Ok(());
        }
        if self.cluster.cache_mode != CacheMode::Distributed {
            anyhow::bail!(
                "l1.enabled requires cluster.cache_mode = 'distributed', got: {:?}",
                self.cluster.cache_mode
            );
        }
        if self.l1.lifespan_ms == 0 {
            anyhow::bail!("l1.lifespan_ms must be > 0");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml(
            r#"
[cluster]
node_id = "node-a"
cache_mode = "distributed"
"#,
        )
        .unwrap();

        assert_eq!(config.cluster.num_segments, 256);
        assert_eq!(config.cluster.num_owners, 2);
        assert_eq!(config.locking.acquire_timeout_ms, 10_000);
        assert_eq!(config.locking.isolation, IsolationLevel::RepeatableRead);
        assert_eq!(config.transaction.mode, TransactionMode::NonTransactional);
        assert!(!config.l1.enabled);
        assert!(config.tracks_read_versions());
    }

    #[test]
    fn test_l1_requires_distribution() {
        let result = Config::from_toml(
            r#"
[cluster]
node_id = "node-a"
cache_mode = "replicated"

[l1]
enabled = true
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_scattered_rejects_transactions() {
        let mut config = Config::for_node("a", CacheMode::Scattered);
        config.transaction.mode = TransactionMode::Pessimistic;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unreliable_return_values_disable_read_tracking() {
        let mut config = Config::for_node("a", CacheMode::Local);
        config.transaction.unreliable_return_values = true;
        assert!(!config.tracks_read_versions());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::for_node("a", CacheMode::Local);
        config.apply_overrides(&ConfigOverrides {
            node_id: Some("b".to_string()),
            log_level: Some("debug".to_string()),
            acquire_timeout_ms: Some(50),
            transaction_mode: Some(TransactionMode::Optimistic),
        });
        assert_eq!(config.cluster.node_id, "b");
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.lock_acquisition_timeout(), Duration::from_millis(50));
        assert_eq!(config.transaction.mode, TransactionMode::Optimistic);
    }
}
