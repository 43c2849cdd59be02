use super::{SnapshotError, SnapshotId, SnapshotMetadata, CHECKSUM_FILE, METADATA_FILE, PENDING_DIR};
use crate::raft::entry::{Configuration, LogBoundary};
use crate::raft::snapshot::{SnapshotChunk, SnapshotDescriptor, SnapshotReplication};
use bytes::Bytes;
use slog::{debug, info, warn, Logger};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A snapshot visible under its final directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedSnapshot {
    pub metadata: SnapshotMetadata,
    pub path: PathBuf,
}

impl PersistedSnapshot {
    pub fn id(&self) -> SnapshotId {
        self.metadata.id
    }

    pub fn descriptor(&self) -> SnapshotDescriptor {
        SnapshotDescriptor {
            id: self.metadata.id.to_string(),
            boundary: self.metadata.boundary,
            configuration: self.metadata.configuration.clone(),
        }
    }
}

/// A snapshot still under `pending/`. Dropped without `persist`, it is removed.
pub struct TransientSnapshot {
    processed_position: i64,
    exported_position: i64,
    path: PathBuf,
    store: FileBasedSnapshotStore,
    persisted: bool,
}

impl TransientSnapshot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn processed_position(&self) -> i64 {
        self.processed_position
    }

    pub fn exported_position(&self) -> i64 {
        self.exported_position
    }

    /// Write the manifest and make the snapshot visible as the latest one.
    pub fn persist(
        mut self,
        boundary: LogBoundary,
        configuration: Configuration,
        last_written_position: i64,
    ) -> Result<PersistedSnapshot, SnapshotError> {
        let metadata = SnapshotMetadata {
            id: SnapshotId {
                index: boundary.index,
                term: boundary.term,
                processed_position: self.processed_position,
                exported_position: self.exported_position,
            },
            boundary,
            configuration,
            last_written_position,
        };
        fs::write(self.path.join(METADATA_FILE), serde_json::to_vec_pretty(&metadata)?)?;
        write_manifest(&self.path)?;
        let persisted = self.store.commit_pending(&self.path, metadata)?;
        self.persisted = true;
        Ok(persisted)
    }
}

impl Drop for TransientSnapshot {
    fn drop(&mut self) {
        if !self.persisted && self.path.exists() {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

/// Keeps a persisted snapshot on disk until dropped, even after newer
/// snapshots were persisted.
pub struct SnapshotReservation {
    id: u64,
    snapshot: PersistedSnapshot,
    store: FileBasedSnapshotStore,
}

impl SnapshotReservation {
    pub fn snapshot(&self) -> &PersistedSnapshot {
        &self.snapshot
    }
}

impl Drop for SnapshotReservation {
    fn drop(&mut self) {
        self.store.lock_reservations().remove(&self.id);
    }
}

struct Inner {
    root: PathBuf,
    chunk_size: usize,
    latest: Mutex<Option<PersistedSnapshot>>,
    reservations: Mutex<BTreeMap<u64, SnapshotId>>,
    next_reservation: AtomicU64,
    logger: Logger,
}

/// Snapshot directory of one partition replica.
#[derive(Clone)]
pub struct FileBasedSnapshotStore {
    inner: Arc<Inner>,
}

impl FileBasedSnapshotStore {
    /// Open the store under `root`, purging pending snapshots and picking the
    /// newest valid persisted one as the latest.
    pub fn open<P: AsRef<Path>>(root: P, chunk_size: usize, logger: Logger) -> Result<Self, SnapshotError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(PENDING_DIR))?;
        let store = FileBasedSnapshotStore {
            inner: Arc::new(Inner {
                root,
                chunk_size: chunk_size.max(1),
                latest: Mutex::new(None),
                reservations: Mutex::new(BTreeMap::new()),
                next_reservation: AtomicU64::new(0),
                logger,
            }),
        };
        store.purge_pending()?;

        let mut candidates = store.list_persisted()?;
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        for (id, path) in candidates {
            match load_metadata(&path).and_then(|metadata| verify_manifest(&path).map(|_| metadata)) {
                Ok(metadata) => {
                    info!(store.inner.logger, "Found persisted snapshot"; "snapshot" => %id);
                    *store.lock_latest() = Some(PersistedSnapshot { metadata, path });
                    break;
                }
                Err(e) => {
                    warn!(store.inner.logger, "Deleting invalid snapshot"; "snapshot" => %id, "error" => %e);
                    fs::remove_dir_all(&path)?;
                }
            }
        }
        if let Some(latest) = store.latest() {
            store.delete_older_than(latest.id())?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn latest(&self) -> Option<PersistedSnapshot> {
        self.lock_latest().clone()
    }

    /// Reserve the latest snapshot so that newer ones do not delete it.
    pub fn reserve_latest(&self) -> Option<SnapshotReservation> {
        // a concurrent persist deletes only after it sees the reservation
        let latest = self.lock_latest();
        let snapshot = latest.clone()?;
        let id = self.inner.next_reservation.fetch_add(1, Ordering::Relaxed);
        self.lock_reservations().insert(id, snapshot.id());
        Some(SnapshotReservation {
            id,
            snapshot,
            store: self.clone(),
        })
    }

    /// Create a transient snapshot: `write` must create and fill the directory it is given.
    pub fn take_transient<F>(
        &self,
        processed_position: i64,
        exported_position: i64,
        write: F,
    ) -> Result<TransientSnapshot, SnapshotError>
    where
        F: FnOnce(&Path) -> Result<(), SnapshotError>,
    {
        let path = self
            .pending_dir()
            .join(format!("{}-{}", processed_position, exported_position));
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        let transient = TransientSnapshot {
            processed_position,
            exported_position,
            path,
            store: self.clone(),
            persisted: false,
        };
        write(&transient.path)?;
        if !transient.path.is_dir() {
            return Err(SnapshotError::Aborted("snapshot writer created no directory".into()));
        }
        Ok(transient)
    }

    /// Delete every persisted snapshot older than `id` that is not reserved.
    pub fn delete_older_than(&self, id: SnapshotId) -> Result<usize, SnapshotError> {
        let reserved: Vec<SnapshotId> = self.lock_reservations().values().copied().collect();
        let mut deleted = 0;
        for (other, path) in self.list_persisted()? {
            if reserved.contains(&other) {
                debug!(self.inner.logger, "Keeping reserved snapshot"; "snapshot" => %other);
                continue;
            }
            if other < id {
                fs::remove_dir_all(&path)?;
                debug!(self.inner.logger, "Deleted old snapshot"; "snapshot" => %other);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn purge_pending(&self) -> Result<(), SnapshotError> {
        for entry in fs::read_dir(self.pending_dir())? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Copy the state files of `snapshot` into a fresh `target` directory.
    pub fn restore(&self, snapshot: &PersistedSnapshot, target: &Path) -> Result<(), SnapshotError> {
        verify_manifest(&snapshot.path)?;
        if target.exists() {
            fs::remove_dir_all(target)?;
        }
        fs::create_dir_all(target)?;
        for name in list_files(&snapshot.path)? {
            if name == CHECKSUM_FILE || name == METADATA_FILE {
                continue;
            }
            fs::copy(snapshot.path.join(&name), target.join(&name))?;
        }
        info!(self.inner.logger, "Restored snapshot"; "snapshot" => %snapshot.id(), "target" => target.display());
        Ok(())
    }

    /// Every file of `snapshot` with its content; used by backups.
    pub fn files(&self, snapshot: &PersistedSnapshot) -> Result<Vec<(String, Bytes)>, SnapshotError> {
        list_files(&snapshot.path)?
            .into_iter()
            .map(|name| {
                let data = fs::read(snapshot.path.join(&name))?;
                Ok((name, Bytes::from(data)))
            })
            .collect()
    }

    fn pending_dir(&self) -> PathBuf {
        self.inner.root.join(PENDING_DIR)
    }

    fn lock_latest(&self) -> std::sync::MutexGuard<'_, Option<PersistedSnapshot>> {
        self.inner.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reservations(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, SnapshotId>> {
        self.inner.reservations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn list_persisted(&self) -> Result<Vec<(SnapshotId, PathBuf)>, SnapshotError> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.inner.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(id) = name.parse::<SnapshotId>() {
                snapshots.push((id, entry.path()));
            }
        }
        Ok(snapshots)
    }

    /// Move a complete pending directory to its final place and make it the latest snapshot.
    fn commit_pending(&self, pending: &Path, metadata: SnapshotMetadata) -> Result<PersistedSnapshot, SnapshotError> {
        if let Some(latest) = self.latest() {
            if latest.id() >= metadata.id {
                return Err(SnapshotError::Aborted(format!(
                    "snapshot {} is not newer than {}",
                    metadata.id,
                    latest.id()
                )));
            }
        }
        sync_dir_files(pending)?;
        let target = self.inner.root.join(metadata.id.to_string());
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(pending, &target)?;
        File::open(&self.inner.root)?.sync_all()?;

        let persisted = PersistedSnapshot { metadata, path: target };
        *self.lock_latest() = Some(persisted.clone());
        info!(self.inner.logger, "Persisted snapshot"; "snapshot" => %persisted.id());
        self.delete_older_than(persisted.id())?;
        Ok(persisted)
    }

    /// The chunk layout of a snapshot directory: (file, offset, length) per chunk.
    fn chunk_layout(&self, dir: &Path) -> Result<Vec<(String, u64, usize)>, SnapshotError> {
        let chunk_size = self.inner.chunk_size as u64;
        let mut layout = Vec::new();
        for name in list_files(dir)? {
            let len = fs::metadata(dir.join(&name))?.len();
            if len == 0 {
                layout.push((name, 0, 0));
                continue;
            }
            let mut offset = 0;
            while offset < len {
                let size = chunk_size.min(len - offset) as usize;
                layout.push((name.clone(), offset, size));
                offset += size as u64;
            }
        }
        Ok(layout)
    }

    fn read_chunk_inner(&self, snapshot_id: &str, chunk_index: u32) -> Result<SnapshotChunk, SnapshotError> {
        let latest = self
            .latest()
            .filter(|s| s.id().to_string() == snapshot_id)
            .ok_or_else(|| SnapshotError::NotFound(snapshot_id.to_string()))?;
        let layout = self.chunk_layout(&latest.path)?;
        let (file_name, offset, len) = layout
            .get(chunk_index as usize)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(format!("{} chunk {}", snapshot_id, chunk_index)))?;

        let mut file = File::open(latest.path.join(&file_name))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0; len];
        file.read_exact(&mut data)?;
        Ok(SnapshotChunk {
            index: chunk_index,
            total: layout.len() as u32,
            file_name,
            offset,
            checksum: crc32fast::hash(&data),
            data: Bytes::from(data),
        })
    }

    fn receive_dir(&self, snapshot_id: &str) -> PathBuf {
        self.pending_dir().join(format!("received-{}", snapshot_id))
    }

    fn write_chunk_inner(&self, snapshot: &SnapshotDescriptor, chunk: &SnapshotChunk) -> Result<(), SnapshotError> {
        if !chunk.verify() {
            return Err(SnapshotError::Corrupted {
                id: snapshot.id.clone(),
                reason: format!("chunk {} failed its checksum", chunk.index),
            });
        }
        if chunk.file_name.contains('/') || chunk.file_name.contains("..") {
            return Err(SnapshotError::Corrupted {
                id: snapshot.id.clone(),
                reason: format!("invalid file name {:?}", chunk.file_name),
            });
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.receive_dir(&snapshot.id).join(&chunk.file_name))?;
        file.seek(SeekFrom::Start(chunk.offset))?;
        file.write_all(&chunk.data)?;
        Ok(())
    }

    fn complete_receive_inner(&self, snapshot: &SnapshotDescriptor) -> Result<(), SnapshotError> {
        let dir = self.receive_dir(&snapshot.id);
        verify_manifest(&dir)?;
        let metadata = load_metadata(&dir)?;
        if metadata.id.to_string() != snapshot.id || metadata.boundary != snapshot.boundary {
            return Err(SnapshotError::Corrupted {
                id: snapshot.id.clone(),
                reason: "metadata does not match the announced snapshot".into(),
            });
        }
        self.commit_pending(&dir, metadata)?;
        Ok(())
    }
}

impl SnapshotReplication for FileBasedSnapshotStore {
    fn latest(&self) -> Option<SnapshotDescriptor> {
        FileBasedSnapshotStore::latest(self).map(|s| s.descriptor())
    }

    fn read_chunk(&self, snapshot_id: &str, chunk_index: u32) -> Result<SnapshotChunk, String> {
        self.read_chunk_inner(snapshot_id, chunk_index).map_err(|e| e.to_string())
    }

    fn begin_receive(&self, snapshot: &SnapshotDescriptor) -> Result<(), String> {
        let dir = self.receive_dir(&snapshot.id);
        let reset = || -> Result<(), std::io::Error> {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            fs::create_dir_all(&dir)
        };
        reset().map_err(|e| e.to_string())
    }

    fn write_chunk(&self, snapshot: &SnapshotDescriptor, chunk: &SnapshotChunk) -> Result<(), String> {
        self.write_chunk_inner(snapshot, chunk).map_err(|e| e.to_string())
    }

    fn complete_receive(&self, snapshot: &SnapshotDescriptor) -> Result<(), String> {
        self.complete_receive_inner(snapshot).map_err(|e| e.to_string())
    }

    fn abort_receive(&self, snapshot_id: &str) {
        let dir = self.receive_dir(snapshot_id);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(self.inner.logger, "Failed to discard received snapshot"; "snapshot" => snapshot_id, "error" => %e);
            }
        }
    }
}

fn list_files(dir: &Path) -> Result<Vec<String>, SnapshotError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn checksums(dir: &Path) -> Result<BTreeMap<String, u32>, SnapshotError> {
    let mut sums = BTreeMap::new();
    for name in list_files(dir)? {
        if name == CHECKSUM_FILE {
            continue;
        }
        let mut hasher = crc32fast::Hasher::new();
        let mut file = File::open(dir.join(&name))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        sums.insert(name, hasher.finalize());
    }
    Ok(sums)
}

/// `CHECKSUM`: one `<crc32 hex> <file name>` line per file, sorted by name.
fn write_manifest(dir: &Path) -> Result<(), SnapshotError> {
    let mut manifest = String::new();
    for (name, sum) in checksums(dir)? {
        manifest.push_str(&format!("{:08x} {}\n", sum, name));
    }
    fs::write(dir.join(CHECKSUM_FILE), manifest)?;
    Ok(())
}

fn verify_manifest(dir: &Path) -> Result<(), SnapshotError> {
    let id = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let corrupted = |reason: String| SnapshotError::Corrupted { id: id.clone(), reason };

    let manifest = fs::read_to_string(dir.join(CHECKSUM_FILE))
        .map_err(|e| corrupted(format!("missing checksum manifest: {}", e)))?;
    let mut expected = BTreeMap::new();
    for line in manifest.lines().filter(|l| !l.is_empty()) {
        let (sum, name) = line
            .split_once(' ')
            .ok_or_else(|| corrupted(format!("malformed manifest line {:?}", line)))?;
        let sum = u32::from_str_radix(sum, 16).map_err(|_| corrupted(format!("malformed checksum {:?}", sum)))?;
        expected.insert(name.to_string(), sum);
    }
    let actual = checksums(dir)?;
    if actual != expected {
        return Err(corrupted("file checksums do not match the manifest".into()));
    }
    Ok(())
}

fn load_metadata(dir: &Path) -> Result<SnapshotMetadata, SnapshotError> {
    Ok(serde_json::from_slice(&fs::read(dir.join(METADATA_FILE))?)?)
}

fn sync_dir_files(dir: &Path) -> Result<(), SnapshotError> {
    for name in list_files(dir)? {
        File::open(dir.join(name))?.sync_all()?;
    }
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_logger;

    fn boundary(index: u64, position: i64) -> LogBoundary {
        LogBoundary {
            index,
            term: 1,
            position,
        }
    }

    fn take(store: &FileBasedSnapshotStore, processed: i64, content: &'static [u8]) -> TransientSnapshot {
        store
            .take_transient(processed, processed, |dir| {
                fs::create_dir_all(dir)?;
                fs::write(dir.join("state.sst"), content)?;
                fs::write(dir.join("empty"), b"")?;
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBasedSnapshotStore::open(dir.path(), 4, test_logger()).unwrap();
        assert!(store.latest().is_none());

        let persisted = take(&store, 10, b"hello world")
            .persist(boundary(5, 10), Configuration::new([1, 2, 3]), 12)
            .unwrap();
        assert_eq!(persisted.id().to_string(), "5-1-10-10");
        assert!(persisted.path.join(CHECKSUM_FILE).exists());
        assert!(fs::read_dir(store.root().join(PENDING_DIR)).unwrap().next().is_none());

        let reopened = FileBasedSnapshotStore::open(dir.path(), 4, test_logger()).unwrap();
        assert_eq!(reopened.latest(), Some(persisted));
    }

    #[test]
    fn test_newer_snapshot_deletes_older() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBasedSnapshotStore::open(dir.path(), 1024, test_logger()).unwrap();
        let first = take(&store, 10, b"a").persist(boundary(5, 10), Configuration::default(), 10).unwrap();
        let second = take(&store, 20, b"b").persist(boundary(9, 20), Configuration::default(), 20).unwrap();
        assert!(!first.path.exists());
        assert_eq!(store.latest().unwrap().id(), second.id());

        // not newer than the latest
        let stale = take(&store, 15, b"c").persist(boundary(7, 15), Configuration::default(), 15);
        assert!(matches!(stale, Err(SnapshotError::Aborted(_))));
    }

    #[test]
    fn test_reserved_snapshot_survives_newer_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBasedSnapshotStore::open(dir.path(), 1024, test_logger()).unwrap();
        let first = take(&store, 10, b"a").persist(boundary(5, 10), Configuration::default(), 10).unwrap();
        let reservation = store.reserve_latest().unwrap();
        assert_eq!(reservation.snapshot(), &first);

        let second = take(&store, 20, b"b").persist(boundary(9, 20), Configuration::default(), 20).unwrap();
        assert!(first.path.exists());
        assert_eq!(store.latest().unwrap().id(), second.id());
        assert!(!store.files(&first).unwrap().is_empty());

        drop(reservation);
        let third = take(&store, 30, b"c").persist(boundary(12, 30), Configuration::default(), 30).unwrap();
        assert!(!first.path.exists());
        assert!(!second.path.exists());
        assert!(third.path.exists());
    }

    #[test]
    fn test_dropped_transient_is_removed_and_pending_purged() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBasedSnapshotStore::open(dir.path(), 1024, test_logger()).unwrap();
        let transient = take(&store, 10, b"a");
        let path = transient.path().to_path_buf();
        drop(transient);
        assert!(!path.exists());

        fs::create_dir_all(store.root().join(PENDING_DIR).join("leftover")).unwrap();
        FileBasedSnapshotStore::open(dir.path(), 1024, test_logger()).unwrap();
        assert!(!store.root().join(PENDING_DIR).join("leftover").exists());
    }

    #[test]
    fn test_corrupted_snapshot_is_skipped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBasedSnapshotStore::open(dir.path(), 1024, test_logger()).unwrap();
        let persisted = take(&store, 10, b"original").persist(boundary(5, 10), Configuration::default(), 10).unwrap();
        fs::write(persisted.path.join("state.sst"), b"tampered").unwrap();

        let reopened = FileBasedSnapshotStore::open(dir.path(), 1024, test_logger()).unwrap();
        assert!(reopened.latest().is_none());
        assert!(!persisted.path.exists());
    }

    #[test]
    fn test_replicate_in_chunks() {
        let leader_dir = tempfile::tempdir().unwrap();
        let follower_dir = tempfile::tempdir().unwrap();
        let leader = FileBasedSnapshotStore::open(leader_dir.path(), 3, test_logger()).unwrap();
        let follower = FileBasedSnapshotStore::open(follower_dir.path(), 3, test_logger()).unwrap();
        take(&leader, 10, b"0123456789")
            .persist(boundary(5, 10), Configuration::new([1]), 10)
            .unwrap();

        let descriptor = SnapshotReplication::latest(&leader).unwrap();
        follower.begin_receive(&descriptor).unwrap();
        let mut index = 0;
        loop {
            let chunk = leader.read_chunk(&descriptor.id, index).unwrap();
            follower.write_chunk(&descriptor, &chunk).unwrap();
            if chunk.is_last() {
                break;
            }
            index += 1;
        }
        follower.complete_receive(&descriptor).unwrap();

        let received = follower.latest().unwrap();
        assert_eq!(received.descriptor(), descriptor);
        assert_eq!(fs::read(received.path.join("state.sst")).unwrap(), b"0123456789");

        let restored = follower_dir.path().join("runtime");
        follower.restore(&received, &restored).unwrap();
        assert!(restored.join("state.sst").exists());
        assert!(restored.join("empty").exists());
        assert!(!restored.join(METADATA_FILE).exists());
    }

    #[test]
    fn test_receive_rejects_bad_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBasedSnapshotStore::open(dir.path(), 1024, test_logger()).unwrap();
        let descriptor = SnapshotDescriptor {
            id: "5-1-10-10".into(),
            boundary: boundary(5, 10),
            configuration: Configuration::default(),
        };
        store.begin_receive(&descriptor).unwrap();
        let chunk = SnapshotChunk {
            index: 0,
            total: 1,
            file_name: "state.sst".into(),
            offset: 0,
            data: Bytes::from_static(b"abc"),
            checksum: 0,
        };
        assert!(store.write_chunk(&descriptor, &chunk).is_err());
        assert!(store.complete_receive(&descriptor).is_err());
        store.abort_receive(&descriptor.id);
        assert!(store.latest().is_none());
    }
}
