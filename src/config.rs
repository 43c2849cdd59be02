//! Configuration for raftstream brokers
//!
//! A broker is configured from a TOML file (see [`BrokerConfig::from_file`]) and
//! optionally adjusted with the `with_*` builders, which is how tests and the
//! CLI override individual settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A cluster member and the address its peer transport listens on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberConfig {
    pub node_id: u64,
    pub address: String,
}

/// Raft timing, expressed in ticks of `tick_interval_ms`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub tick_interval_ms: u64,
    /// Ticks without leader contact before a follower campaigns (randomized up to 2x).
    pub election_tick: u32,
    pub heartbeat_tick: u32,
    /// Upper bound on entries shipped in one AppendEntries message.
    pub max_append_entries: usize,
    pub snapshot_chunk_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            election_tick: 15,
            heartbeat_tick: 5,
            max_append_entries: 64,
            snapshot_chunk_size: 512 * 1024,
        }
    }
}

impl RaftConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        self.tick_interval() * self.election_tick
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Bound on client commands awaiting a response per partition.
    pub max_in_flight_commands: usize,
    pub request_timeout_ms: u64,
    /// Base delay before retrying a failed append of follow-up records.
    pub retry_delay_ms: u64,
    pub due_date_check_interval_ms: u64,
    pub redistribution_interval_ms: u64,
    pub max_redistribution_interval_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_in_flight_commands: 256,
            request_timeout_ms: 15_000,
            retry_delay_ms: 250,
            due_date_check_interval_ms: 1_000,
            redistribution_interval_ms: 1_000,
            max_redistribution_interval_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub period_ms: u64,
    /// Entries appended since the last snapshot before health turns unhealthy.
    pub log_growth_threshold: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            period_ms: 5 * 60 * 1_000,
            log_growth_threshold: 100_000,
            max_retry_delay_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Exporter ids whose acknowledged positions bound compaction.
    pub ids: Vec<String>,
    pub flush_interval_ms: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            flush_interval_ms: 1_000,
        }
    }
}

/// Top-level broker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub node_id: u64,
    pub data_dir: PathBuf,
    /// Address the HTTP peer endpoint binds to.
    pub listen_address: String,
    pub members: Vec<MemberConfig>,
    pub partition_count: u32,
    pub replication_factor: usize,
    pub actor_threads: usize,
    pub backup_dir: Option<PathBuf>,
    pub log_level: String,
    pub raft: RaftConfig,
    pub processing: ProcessingConfig,
    pub snapshot: SnapshotConfig,
    pub exporters: ExporterConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            data_dir: PathBuf::from("data"),
            listen_address: "127.0.0.1:26501".to_string(),
            members: vec![MemberConfig {
                node_id: 1,
                address: "http://127.0.0.1:26501".to_string(),
            }],
            partition_count: 1,
            replication_factor: 1,
            actor_threads: 2,
            backup_dir: None,
            log_level: "info".to_string(),
            raft: RaftConfig::default(),
            processing: ProcessingConfig::default(),
            snapshot: SnapshotConfig::default(),
            exporters: ExporterConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Single-node configuration rooted at `data_dir`.
    pub fn single_node<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_listen_address(mut self, address: String) -> Self {
        self.listen_address = address;
        self
    }

    pub fn with_members(mut self, members: Vec<MemberConfig>) -> Self {
        self.members = members;
        self
    }

    pub fn with_partitions(mut self, partition_count: u32, replication_factor: usize) -> Self {
        self.partition_count = partition_count;
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_exporters(mut self, ids: Vec<String>) -> Self {
        self.exporters.ids = ids;
        self
    }

    pub fn with_snapshot_period(mut self, period: Duration) -> Self {
        self.snapshot.period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_backup_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.log_level = level.to_string();
        self
    }

    /// Member addresses keyed by node id.
    pub fn member_addresses(&self) -> BTreeMap<u64, String> {
        self.members
            .iter()
            .map(|m| (m.node_id, m.address.clone()))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_count == 0 {
            return Err(ConfigError::Invalid("partition_count must be at least 1".into()));
        }
        if self.members.is_empty() {
            return Err(ConfigError::Invalid("members must not be empty".into()));
        }
        if !self.members.iter().any(|m| m.node_id == self.node_id) {
            return Err(ConfigError::Invalid(format!(
                "node {} is not listed in members",
                self.node_id
            )));
        }
        if self.member_addresses().len() != self.members.len() {
            return Err(ConfigError::Invalid("duplicate node id in members".into()));
        }
        if self.replication_factor == 0 || self.replication_factor > self.members.len() {
            return Err(ConfigError::Invalid(format!(
                "replication_factor {} must be between 1 and the member count {}",
                self.replication_factor,
                self.members.len()
            )));
        }
        if self.raft.heartbeat_tick == 0 || self.raft.election_tick <= self.raft.heartbeat_tick {
            return Err(ConfigError::Invalid(
                "election_tick must be greater than heartbeat_tick".into(),
            ));
        }
        if self.raft.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".into()));
        }
        if self.processing.max_in_flight_commands == 0 {
            return Err(ConfigError::Invalid("max_in_flight_commands must be positive".into()));
        }
        if self.actor_threads == 0 {
            return Err(ConfigError::Invalid("actor_threads must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        BrokerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let config = BrokerConfig::from_toml_str(
            r#"
            node_id = 2
            data_dir = "/tmp/raftstream"
            partition_count = 3
            replication_factor = 3

            [[members]]
            node_id = 1
            address = "http://10.0.0.1:26501"

            [[members]]
            node_id = 2
            address = "http://10.0.0.2:26501"

            [[members]]
            node_id = 3
            address = "http://10.0.0.3:26501"

            [raft]
            election_tick = 20

            [exporters]
            ids = ["search"]
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id, 2);
        assert_eq!(config.partition_count, 3);
        assert_eq!(config.raft.election_tick, 20);
        assert_eq!(config.raft.heartbeat_tick, 5);
        assert_eq!(config.exporters.ids, vec!["search".to_string()]);
        assert_eq!(config.member_addresses().len(), 3);
    }

    #[test]
    fn test_rejects_unknown_node() {
        let err = BrokerConfig::default().with_node_id(7).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_timing() {
        let mut config = BrokerConfig::default();
        config.raft.election_tick = 3;
        config.raft.heartbeat_tick = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_replication_above_members() {
        let config = BrokerConfig::default().with_partitions(1, 3);
        assert!(config.validate().is_err());
    }
}
