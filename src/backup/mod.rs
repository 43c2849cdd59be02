//! Partition backups
//!
//! A backup of a partition at checkpoint `C` is the latest snapshot whose
//! processed position is at or below `C` plus the committed log records
//! between that snapshot's compaction position and `C`. Restoring the
//! snapshot and replaying the records reproduces the state as of `C`.

mod local;
mod service;

pub use self::local::LocalBackupStore;
pub use self::service::{BackupService, BackupServiceConfig, CheckpointCommands};

use crate::logstream::LogStreamError;
use crate::protocol::Record;
use crate::snapshot::SnapshotError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("checkpoint {checkpoint_id} was rejected: {reason}")]
    CheckpointRejected { checkpoint_id: i64, reason: String },

    #[error("checkpoint {0} is not newer than the latest checkpoint")]
    StaleCheckpoint(i64),

    #[error("no snapshot at or below position {0} and the log was already compacted")]
    NoUsableSnapshot(i64),

    #[error("backup {checkpoint_id} of partition {partition_id} not found")]
    NotFound { partition_id: u32, checkpoint_id: i64 },

    #[error("failed to submit the checkpoint command: {0}")]
    Submit(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Log(#[from] LogStreamError),

    #[error("backup store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode backup: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Identity and coverage of a backup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub partition_id: u32,
    pub node_id: u64,
    pub checkpoint_id: i64,
    pub checkpoint_position: i64,
    pub snapshot_id: Option<String>,
    /// Records after this position are in the backup's log.
    pub log_start_position: i64,
    pub record_count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Backup {
    pub descriptor: BackupDescriptor,
    /// Files of the snapshot, empty without a snapshot.
    pub snapshot_files: Vec<(String, Bytes)>,
    pub records: Vec<Record>,
}

/// Destination for backups, e.g. an object store.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn save(&self, backup: Backup) -> Result<(), BackupError>;

    async fn load(&self, partition_id: u32, checkpoint_id: i64) -> Result<Backup, BackupError>;

    async fn list(&self, partition_id: u32) -> Result<Vec<BackupDescriptor>, BackupError>;
}
