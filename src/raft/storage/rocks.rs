//! RocksDB-backed log storage
//!
//! # Schema Design
//!
//! **Entries Column Family:**
//! - Key: entry index (u64, big-endian so iteration follows log order)
//! - Value: JSON-serialized [`LogEntry`]
//!
//! **Metadata Column Family:**
//! - `node_id` → u64
//! - `hard_state` → [`HardState`] (term, vote, commit)
//! - `configuration` → [`Configuration`]
//! - `boundary` → [`LogBoundary`] of the compacted prefix
//!
//! The last index and last position are derived from the entries on open and
//! cached afterwards. Every write goes through a synced `WriteBatch`.

use super::{highest_position, LogStorage};
use crate::raft::entry::{Configuration, HardState, LogBoundary, LogEntry, NodeId};
use crate::raft::errors::StorageError;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

const CF_ENTRIES: &str = "entries";
const CF_METADATA: &str = "metadata";

const KEY_NODE_ID: &[u8] = b"node_id";
const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_CONFIGURATION: &[u8] = b"configuration";
const KEY_BOUNDARY: &[u8] = b"boundary";

#[derive(Clone, Default)]
struct Cache {
    hard_state: HardState,
    configuration: Configuration,
    boundary: LogBoundary,
    last_index: u64,
    last_position: i64,
}

/// RocksDB-backed persistent Raft log
pub struct RocksLogStorage {
    db: DB,
    cache: RwLock<Cache>,
}

impl RocksLogStorage {
    /// Open the log at `path`, creating it with `configuration` when it is new.
    ///
    /// Fails when the directory belongs to a different node.
    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        node_id: NodeId,
        configuration: Configuration,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        let storage = Self {
            db,
            cache: RwLock::new(Cache::default()),
        };
        storage.initialize_if_needed(node_id, configuration)?;
        storage.reload_cache()?;
        Ok(storage)
    }

    fn initialize_if_needed(&self, node_id: NodeId, configuration: Configuration) -> Result<(), StorageError> {
        match self.get_meta::<NodeId>(KEY_NODE_ID)? {
            Some(stored) if stored != node_id => Err(StorageError::Corrupted(format!(
                "node id mismatch: storage belongs to {}, opened by {}",
                stored, node_id
            ))),
            Some(_) => Ok(()),
            None => {
                let mut batch = WriteBatch::default();
                let cf = self.cf(CF_METADATA)?;
                batch.put_cf(cf, KEY_NODE_ID, serde_json::to_vec(&node_id)?);
                batch.put_cf(cf, KEY_HARD_STATE, serde_json::to_vec(&HardState::default())?);
                batch.put_cf(cf, KEY_CONFIGURATION, serde_json::to_vec(&configuration)?);
                batch.put_cf(cf, KEY_BOUNDARY, serde_json::to_vec(&LogBoundary::default())?);
                self.write_batch(batch)
            }
        }
    }

    fn reload_cache(&self) -> Result<(), StorageError> {
        let hard_state = self.get_meta(KEY_HARD_STATE)?.unwrap_or_default();
        let configuration = self.get_meta(KEY_CONFIGURATION)?.unwrap_or_default();
        let boundary: LogBoundary = self.get_meta(KEY_BOUNDARY)?.unwrap_or_default();

        let mut last_index = boundary.index;
        let mut last_position = boundary.position;
        for item in self.db.iterator_cf(self.cf(CF_ENTRIES)?, IteratorMode::Start) {
            let (_, value) = item?;
            let entry: LogEntry = serde_json::from_slice(&value)?;
            if entry.index != last_index + 1 {
                return Err(StorageError::Corrupted(format!(
                    "gap in log: entry {} follows {}",
                    entry.index, last_index
                )));
            }
            last_index = entry.index;
            if let Some(position) = entry.highest_position() {
                last_position = position;
            }
        }

        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Cache {
            hard_state,
            configuration,
            boundary,
            last_index,
            last_position,
        };
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Corrupted(format!("missing column family {}", name)))
    }

    fn get_meta<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.db.get_cf(self.cf(CF_METADATA)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_meta<T: Serialize>(&self, key: &[u8], value: &T) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_METADATA)?, key, serde_json::to_vec(value)?);
        self.write_batch(batch)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn cached(&self) -> Cache {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn load_entries(&self, low: u64, high: u64) -> Result<Vec<LogEntry>, StorageError> {
        let cf = self.cf(CF_ENTRIES)?;
        let mut entries = Vec::with_capacity((high.saturating_sub(low)) as usize);
        for index in low..high {
            match self.db.get_cf(cf, index.to_be_bytes())? {
                Some(bytes) => entries.push(serde_json::from_slice(&bytes)?),
                None => {
                    return Err(StorageError::Corrupted(format!("missing entry {}", index)));
                }
            }
        }
        Ok(entries)
    }
}

impl LogStorage for RocksLogStorage {
    fn hard_state(&self) -> HardState {
        self.cached().hard_state
    }

    fn save_hard_state(&self, hs: HardState) -> Result<(), StorageError> {
        self.put_meta(KEY_HARD_STATE, &hs)?;
        self.cache.write().unwrap_or_else(PoisonError::into_inner).hard_state = hs;
        Ok(())
    }

    fn configuration(&self) -> Configuration {
        self.cached().configuration
    }

    fn save_configuration(&self, configuration: &Configuration) -> Result<(), StorageError> {
        self.put_meta(KEY_CONFIGURATION, configuration)?;
        self.cache.write().unwrap_or_else(PoisonError::into_inner).configuration = configuration.clone();
        Ok(())
    }

    fn boundary(&self) -> LogBoundary {
        self.cached().boundary
    }

    fn last_index(&self) -> u64 {
        self.cached().last_index
    }

    fn last_position(&self) -> i64 {
        self.cached().last_position
    }

    fn entry(&self, index: u64) -> Result<Option<LogEntry>, StorageError> {
        let cache = self.cached();
        if index <= cache.boundary.index || index > cache.last_index {
            return Ok(None);
        }
        match self.db.get_cf(self.cf(CF_ENTRIES)?, index.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn entries(&self, low: u64, high: u64, max: usize) -> Result<Vec<LogEntry>, StorageError> {
        let cache = self.cached();
        if low <= cache.boundary.index {
            return Err(StorageError::Compacted { index: low });
        }
        let high = high.min(cache.last_index + 1).min(low.saturating_add(max as u64));
        if low >= high {
            return Ok(Vec::new());
        }
        self.load_entries(low, high)
    }

    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let (first, last) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(()),
        };
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let mut expected = cache.last_index + 1;
        if first.index != expected {
            return Err(StorageError::NonContiguous {
                expected,
                actual: first.index,
            });
        }

        let cf = self.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::NonContiguous {
                    expected,
                    actual: entry.index,
                });
            }
            batch.put_cf(cf, entry.index.to_be_bytes(), serde_json::to_vec(entry)?);
            expected += 1;
        }
        self.write_batch(batch)?;

        cache.last_index = last.index;
        if let Some(position) = highest_position(entries.iter()) {
            cache.last_position = position;
        }
        Ok(())
    }

    fn truncate_suffix(&self, from: u64) -> Result<(), StorageError> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if from <= cache.boundary.index {
            return Err(StorageError::Compacted { index: from });
        }
        if from > cache.last_index {
            return Ok(());
        }

        let cf = self.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        for index in from..=cache.last_index {
            batch.delete_cf(cf, index.to_be_bytes());
        }
        self.write_batch(batch)?;

        cache.last_index = from - 1;
        let remaining = self.load_entries(cache.boundary.index + 1, from)?;
        cache.last_position = highest_position(remaining.iter()).unwrap_or(cache.boundary.position);
        Ok(())
    }

    fn compact(&self, through: u64) -> Result<(), StorageError> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if through <= cache.boundary.index {
            return Ok(());
        }
        if through > cache.last_index {
            return Err(StorageError::Unavailable {
                index: through,
                last_index: cache.last_index,
            });
        }

        let removed = self.load_entries(cache.boundary.index + 1, through + 1)?;
        let boundary = LogBoundary {
            index: through,
            term: removed.last().map(|e| e.term).unwrap_or(cache.boundary.term),
            position: highest_position(removed.iter()).unwrap_or(cache.boundary.position),
        };

        let cf_entries = self.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        for entry in &removed {
            batch.delete_cf(cf_entries, entry.index.to_be_bytes());
        }
        batch.put_cf(self.cf(CF_METADATA)?, KEY_BOUNDARY, serde_json::to_vec(&boundary)?);
        self.write_batch(batch)?;

        cache.boundary = boundary;
        Ok(())
    }

    fn reset(&self, boundary: LogBoundary) -> Result<(), StorageError> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);

        let cf_entries = self.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        for index in (cache.boundary.index + 1)..=cache.last_index {
            batch.delete_cf(cf_entries, index.to_be_bytes());
        }
        batch.put_cf(self.cf(CF_METADATA)?, KEY_BOUNDARY, serde_json::to_vec(&boundary)?);
        self.write_batch(batch)?;

        cache.boundary = boundary;
        cache.last_index = boundary.index;
        cache.last_position = boundary.position;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::storage::tests as shared;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> RocksLogStorage {
        RocksLogStorage::open_or_create(dir.path(), 1, Configuration::new([1])).unwrap()
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        shared::check_append_and_read(&open(&dir));
    }

    #[test]
    fn test_truncate_and_compact() {
        let dir = TempDir::new().unwrap();
        shared::check_truncate_and_compact(&open(&dir));
    }

    #[test]
    fn test_hard_state() {
        let dir = TempDir::new().unwrap();
        shared::check_hard_state(&open(&dir));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let storage = open(&dir);
            storage
                .append(&[
                    shared::app_entry(1, 1, 1, 3),
                    shared::app_entry(2, 1, 4, 4),
                    shared::app_entry(3, 2, 5, 9),
                ])
                .unwrap();
            storage.compact(1).unwrap();
            storage
                .save_hard_state(HardState {
                    term: 2,
                    vote: Some(1),
                    commit: 3,
                })
                .unwrap();
        }

        let storage = open(&dir);
        assert_eq!(storage.first_index(), 2);
        assert_eq!(storage.last_index(), 3);
        assert_eq!(storage.last_position(), 9);
        assert_eq!(storage.boundary().position, 3);
        assert_eq!(storage.hard_state().commit, 3);
        assert_eq!(storage.configuration(), Configuration::new([1]));
    }

    #[test]
    fn test_rejects_foreign_node() {
        let dir = TempDir::new().unwrap();
        drop(open(&dir));
        let result = RocksLogStorage::open_or_create(dir.path(), 2, Configuration::new([2]));
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }
}
