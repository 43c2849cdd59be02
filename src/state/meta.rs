use super::{Keyspace, StateError, StateRead, Transaction};
use crate::protocol::key;
use serde::{Deserialize, Serialize};

const KEY_NEXT: &[u8] = b"latest_key";
const KEY_LAST_PROCESSED: &[u8] = b"last_processed_position";

/// Generates the partition's entity keys (`partition_id << 51 | counter`).
#[derive(Clone, Copy, Debug)]
pub struct KeyGenerator {
    partition_id: u32,
}

impl KeyGenerator {
    pub fn new(partition_id: u32) -> Self {
        Self { partition_id }
    }

    fn latest<R: StateRead>(&self, state: &R) -> Result<i64, StateError> {
        Ok(state
            .get_value(Keyspace::KeyGenerator, KEY_NEXT)?
            .unwrap_or_else(|| key::first_key(self.partition_id)))
    }

    pub fn next_key(&self, txn: &mut Transaction) -> Result<i64, StateError> {
        let next = self.latest(&*txn)? + 1;
        txn.put(Keyspace::KeyGenerator, KEY_NEXT, &next)?;
        Ok(next)
    }

    /// Make sure a key chosen elsewhere is never generated again.
    ///
    /// Keys that belong to another partition are ignored.
    pub fn set_key_if_higher(&self, txn: &mut Transaction, used: i64) -> Result<(), StateError> {
        if key::decode_partition_id(used) != self.partition_id {
            return Ok(());
        }
        if used > self.latest(&*txn)? {
            txn.put(Keyspace::KeyGenerator, KEY_NEXT, &used)?;
        }
        Ok(())
    }
}

/// Position of the last command whose results are in the store.
pub struct LastProcessedPositionState;

impl LastProcessedPositionState {
    pub fn get<R: StateRead>(state: &R) -> Result<i64, StateError> {
        Ok(state
            .get_value(Keyspace::LastProcessed, KEY_LAST_PROCESSED)?
            .unwrap_or(key::NONE))
    }

    pub fn mark_processed(txn: &mut Transaction, position: i64) -> Result<(), StateError> {
        txn.put(Keyspace::LastProcessed, KEY_LAST_PROCESSED, &position)
    }
}

/// Acknowledged positions of the configured exporters.
pub struct ExporterPositionState;

impl ExporterPositionState {
    pub fn get<R: StateRead>(state: &R, exporter_id: &str) -> Result<Option<i64>, StateError> {
        state.get_value(Keyspace::ExporterPositions, exporter_id.as_bytes())
    }

    /// Positions only move forward.
    pub fn update(txn: &mut Transaction, exporter_id: &str, position: i64) -> Result<bool, StateError> {
        match Self::get(&*txn, exporter_id)? {
            Some(current) if current >= position => Ok(false),
            _ => {
                txn.put(Keyspace::ExporterPositions, exporter_id.as_bytes(), &position)?;
                Ok(true)
            }
        }
    }

    pub fn all<R: StateRead>(state: &R) -> Result<Vec<(String, i64)>, StateError> {
        state
            .scan_raw(Keyspace::ExporterPositions, &[])?
            .into_iter()
            .map(|(k, v)| {
                let id = String::from_utf8(k).map_err(|e| StateError::Corrupted(e.to_string()))?;
                Ok((id, serde_json::from_slice(&v)?))
            })
            .collect()
    }

    /// Lowest position over `exporters`; an exporter that never acknowledged
    /// counts as position -1. `None` without exporters.
    pub fn lowest<R: StateRead>(state: &R, exporters: &[String]) -> Result<Option<i64>, StateError> {
        let mut lowest: Option<i64> = None;
        for id in exporters {
            let position = Self::get(state, id)?.unwrap_or(key::NONE);
            lowest = Some(lowest.map_or(position, |l| l.min(position)));
        }
        Ok(lowest)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: i64,
    pub checkpoint_position: i64,
}

/// The latest checkpoint created on this partition.
pub struct CheckpointState;

impl CheckpointState {
    const LATEST: &'static [u8] = b"latest";

    pub fn latest<R: StateRead>(state: &R) -> Result<Option<CheckpointInfo>, StateError> {
        state.get_value(Keyspace::Checkpoints, Self::LATEST)
    }

    pub fn set_latest(txn: &mut Transaction, info: &CheckpointInfo) -> Result<(), StateError> {
        txn.put(Keyspace::Checkpoints, Self::LATEST, info)
    }
}
