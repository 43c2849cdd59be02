//! Processing state store
//!
//! The stream processor's state lives in RocksDB, one column family per
//! keyspace. All writes of one processed command go through a
//! [`Transaction`] and become visible atomically on commit. Snapshots are
//! RocksDB checkpoints of the whole store.

mod db;
mod distribution;
mod instance;
mod job;
mod meta;
pub mod migration;

pub use self::db::{StateDb, Transaction, SCHEMA_VERSION};
pub use self::distribution::{DeploymentRecord, DeploymentState, DistributionRecord, DistributionState};
pub use self::instance::{InstanceRecord, InstanceState, InstanceStatus, LegacyInstance, VariableState};
pub use self::job::{JobRecord, JobState, JobStatus, TimerRecord, TimerState};
pub use self::meta::{CheckpointInfo, CheckpointState, ExporterPositionState, KeyGenerator, LastProcessedPositionState};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Keyspace {
    Default,
    KeyGenerator,
    LastProcessed,
    Instances,
    LegacyInstances,
    Variables,
    Jobs,
    Timers,
    TimerDueDates,
    Deployments,
    Distributions,
    PendingDistributions,
    ExporterPositions,
    Checkpoints,
    Migrations,
}

impl Keyspace {
    pub const ALL: [Keyspace; 15] = [
        Keyspace::Default,
        Keyspace::KeyGenerator,
        Keyspace::LastProcessed,
        Keyspace::Instances,
        Keyspace::LegacyInstances,
        Keyspace::Variables,
        Keyspace::Jobs,
        Keyspace::Timers,
        Keyspace::TimerDueDates,
        Keyspace::Deployments,
        Keyspace::Distributions,
        Keyspace::PendingDistributions,
        Keyspace::ExporterPositions,
        Keyspace::Checkpoints,
        Keyspace::Migrations,
    ];

    /// Column family name.
    pub fn name(self) -> &'static str {
        match self {
            Keyspace::Default => "default",
            Keyspace::KeyGenerator => "key_generator",
            Keyspace::LastProcessed => "last_processed",
            Keyspace::Instances => "instances",
            Keyspace::LegacyInstances => "legacy_instances",
            Keyspace::Variables => "variables",
            Keyspace::Jobs => "jobs",
            Keyspace::Timers => "timers",
            Keyspace::TimerDueDates => "timer_due_dates",
            Keyspace::Deployments => "deployments",
            Keyspace::Distributions => "distributions",
            Keyspace::PendingDistributions => "pending_distributions",
            Keyspace::ExporterPositions => "exporter_positions",
            Keyspace::Checkpoints => "checkpoints",
            Keyspace::Migrations => "migrations",
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store error: {0}")]
    Db(#[from] rocksdb::Error),

    #[error("failed to encode or decode state: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("state store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),

    #[error("state store has schema version {found}, newer than supported version {supported}")]
    NewerSchema { found: u32, supported: u32 },

    #[error("corrupted state: {0}")]
    Corrupted(String),
}

/// Read access shared by the store itself and open transactions.
pub trait StateRead {
    fn get_raw(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StateError>;

    /// All entries of `keyspace` whose key starts with `prefix`, in key order.
    fn scan_raw(&self, keyspace: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError>;

    fn get_value<T: DeserializeOwned>(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<T>, StateError>
    where
        Self: Sized,
    {
        match self.get_raw(keyspace, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_values<T: DeserializeOwned>(&self, keyspace: Keyspace, prefix: &[u8]) -> Result<Vec<T>, StateError>
    where
        Self: Sized,
    {
        self.scan_raw(keyspace, prefix)?
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).map_err(StateError::from))
            .collect()
    }

    fn exists(&self, keyspace: Keyspace, key: &[u8]) -> Result<bool, StateError> {
        Ok(self.get_raw(keyspace, key)?.is_some())
    }
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StateError> {
    Ok(serde_json::to_vec(value)?)
}

/// Big-endian so byte order follows numeric order for non-negative keys.
pub(crate) fn long_key(key: i64) -> [u8; 8] {
    key.to_be_bytes()
}

pub(crate) fn read_long(bytes: &[u8]) -> Result<i64, StateError> {
    let array: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StateError::Corrupted(format!("expected 8 key bytes, got {}", bytes.len())))?;
    Ok(i64::from_be_bytes(array))
}
