use super::{encode, Keyspace, StateError, StateRead};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bumped whenever a change to the stored layout cannot be read by older builds.
pub const SCHEMA_VERSION: u32 = 2;

const KEY_SCHEMA_VERSION: &[u8] = b"schema_version";

/// The processing state store of one partition.
#[derive(Clone)]
pub struct StateDb {
    db: Arc<DB>,
    path: PathBuf,
}

impl StateDb {
    /// Open (or create) the store at `path`.
    ///
    /// Fails with [`StateError::NewerSchema`] when the store was written by a
    /// newer build.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = Keyspace::ALL
            .iter()
            .map(|ks| ColumnFamilyDescriptor::new(ks.name(), Options::default()));
        let db = DB::open_cf_descriptors(&opts, &path, cfs)?;

        let store = Self {
            db: Arc::new(db),
            path,
        };
        store.check_schema_version()?;
        Ok(store)
    }

    fn check_schema_version(&self) -> Result<(), StateError> {
        let found: Option<u32> = self.get_value(Keyspace::Default, KEY_SCHEMA_VERSION)?;
        match found {
            Some(found) if found > SCHEMA_VERSION => Err(StateError::NewerSchema {
                found,
                supported: SCHEMA_VERSION,
            }),
            Some(found) if found == SCHEMA_VERSION => Ok(()),
            _ => {
                let mut txn = self.begin();
                txn.put(Keyspace::Default, KEY_SCHEMA_VERSION, &SCHEMA_VERSION)?;
                txn.commit()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin(&self) -> Transaction {
        Transaction {
            db: self.db.clone(),
            writes: BTreeMap::new(),
        }
    }

    /// Write a consistent point-in-time copy of the store to `dest`, which must not exist.
    pub fn checkpoint(&self, dest: &Path) -> Result<(), StateError> {
        let checkpoint = Checkpoint::new(&*self.db)?;
        checkpoint.create_checkpoint(dest)?;
        Ok(())
    }

    /// Every keyspace's content, for comparing replicas.
    pub fn dump(&self) -> Result<BTreeMap<&'static str, Vec<(Vec<u8>, Vec<u8>)>>, StateError> {
        let mut dump = BTreeMap::new();
        for ks in Keyspace::ALL {
            dump.insert(ks.name(), self.scan_raw(ks, &[])?);
        }
        Ok(dump)
    }

    fn cf(&self, keyspace: Keyspace) -> Result<&rocksdb::ColumnFamily, StateError> {
        cf(&self.db, keyspace)
    }
}

fn cf(db: &DB, keyspace: Keyspace) -> Result<&rocksdb::ColumnFamily, StateError> {
    db.cf_handle(keyspace.name())
        .ok_or(StateError::MissingColumnFamily(keyspace.name()))
}

fn scan_db(db: &DB, keyspace: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
    let mut entries = Vec::new();
    for item in db.iterator_cf(cf(db, keyspace)?, IteratorMode::From(prefix, Direction::Forward)) {
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        entries.push((key.to_vec(), value.to_vec()));
    }
    Ok(entries)
}

impl StateRead for StateDb {
    fn get_raw(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.db.get_cf(self.cf(keyspace)?, key)?)
    }

    fn scan_raw(&self, keyspace: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        scan_db(&self.db, keyspace, prefix)
    }
}

/// Buffered writes over a [`StateDb`].
///
/// Reads see the transaction's own writes. Nothing reaches the store until
/// [`Transaction::commit`]; dropping the transaction rolls it back.
pub struct Transaction {
    db: Arc<DB>,
    /// `None` marks a deletion.
    writes: BTreeMap<(Keyspace, Vec<u8>), Option<Vec<u8>>>,
}

impl Transaction {
    pub fn put<T: Serialize + ?Sized>(&mut self, keyspace: Keyspace, key: &[u8], value: &T) -> Result<(), StateError> {
        self.put_raw(keyspace, key, encode(value)?);
        Ok(())
    }

    pub fn put_raw(&mut self, keyspace: Keyspace, key: &[u8], value: Vec<u8>) {
        self.writes.insert((keyspace, key.to_vec()), Some(value));
    }

    pub fn delete(&mut self, keyspace: Keyspace, key: &[u8]) {
        self.writes.insert((keyspace, key.to_vec()), None);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply all writes atomically.
    pub fn commit(self) -> Result<(), StateError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for ((keyspace, key), value) in &self.writes {
            let handle = cf(&self.db, *keyspace)?;
            match value {
                Some(value) => batch.put_cf(handle, key, value),
                None => batch.delete_cf(handle, key),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Discard all writes.
    pub fn rollback(self) {}
}

impl StateRead for Transaction {
    fn get_raw(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        if let Some(value) = self.writes.get(&(keyspace, key.to_vec())) {
            return Ok(value.clone());
        }
        Ok(self.db.get_cf(cf(&self.db, keyspace)?, key)?)
    }

    fn scan_raw(&self, keyspace: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = scan_db(&self.db, keyspace, prefix)?.into_iter().collect();
        let start = (keyspace, prefix.to_vec());
        for ((ks, key), value) in self.writes.range((Bound::Included(start), Bound::Unbounded)) {
            if *ks != keyspace || !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }
}
