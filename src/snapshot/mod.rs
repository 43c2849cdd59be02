//! Snapshots of the processing state
//!
//! A snapshot is a RocksDB checkpoint of a partition's state store plus a
//! `metadata.json` and a `CHECKSUM` manifest, persisted under
//! `snapshots/<id>/`. Snapshots are first written to `snapshots/pending/`
//! and only become visible through an atomic rename once complete, so a
//! crash never leaves a half-written snapshot behind as the latest one.

mod director;
mod store;

pub use self::director::{
    SnapshotDirector, SnapshotDirectorConfig, SnapshotDirectorHandle, SnapshotLog, SnapshotMessage,
};
pub use self::store::{FileBasedSnapshotStore, PersistedSnapshot, SnapshotReservation, TransientSnapshot};

use crate::raft::entry::{Configuration, LogBoundary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub const CHECKSUM_FILE: &str = "CHECKSUM";
pub const METADATA_FILE: &str = "metadata.json";
pub const PENDING_DIR: &str = "pending";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode snapshot metadata: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    State(#[from] crate::state::StateError),

    #[error(transparent)]
    Log(#[from] crate::raft::errors::RaftError),

    #[error("snapshot {id} is corrupted: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("invalid snapshot id {0:?}")]
    InvalidId(String),

    #[error("snapshot {0} not found")]
    NotFound(String),

    #[error("a snapshot is already being taken")]
    InProgress,

    #[error("snapshot aborted: {0}")]
    Aborted(String),
}

/// `{index}-{term}-{processed_position}-{exported_position}`.
///
/// Orders by log index first, so the latest snapshot is the greatest id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub index: u64,
    pub term: u64,
    pub processed_position: i64,
    pub exported_position: i64,
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.index, self.term, self.processed_position, self.exported_position
        )
    }
}

impl FromStr for SnapshotId {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SnapshotError::InvalidId(s.to_string());
        // positions may be -1, so split from the left on the first three dashes only
        let mut parts = s.splitn(3, '-');
        let index = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let term = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let rest = parts.next().ok_or_else(invalid)?;
        let split = rest
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '-')
            .map(|(i, _)| i)
            .ok_or_else(invalid)?;
        let processed_position = rest[..split].parse().map_err(|_| invalid())?;
        let exported_position = rest[split + 1..].parse().map_err(|_| invalid())?;
        Ok(SnapshotId {
            index,
            term,
            processed_position,
            exported_position,
        })
    }
}

/// Contents of `metadata.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: SnapshotId,
    pub boundary: LogBoundary,
    pub configuration: Configuration,
    /// Highest position written by the processor when the snapshot was taken.
    pub last_written_position: i64,
}

impl SnapshotMetadata {
    /// The position up to which the log may be compacted.
    pub fn compaction_position(&self) -> i64 {
        self.id.processed_position.min(self.id.exported_position)
    }
}

/// Positions that must stay in the log, e.g. while a backup copies it.
#[derive(Clone, Default)]
pub struct CompactionPins {
    next_id: Arc<AtomicU64>,
    pins: Arc<Mutex<BTreeMap<u64, i64>>>,
}

impl CompactionPins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep every record after `position` until the guard is dropped.
    pub fn pin(&self, position: i64) -> PinGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, position);
        PinGuard {
            id,
            pins: self.pins.clone(),
        }
    }

    pub fn lowest(&self) -> Option<i64> {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .min()
            .copied()
    }
}

pub struct PinGuard {
    id: u64,
    pins: Arc<Mutex<BTreeMap<u64, i64>>>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
