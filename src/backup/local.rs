use super::{Backup, BackupDescriptor, BackupError, BackupStore};
use crate::protocol::Record;
use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "manifest.json";
const LOG_FILE: &str = "log.jsonl";
const SNAPSHOT_DIR: &str = "snapshot";

/// Backups in a local directory:
/// `<root>/partition-<id>/<checkpoint id>/{manifest.json, log.jsonl, snapshot/}`.
#[derive(Clone, Debug)]
pub struct LocalBackupStore {
    root: PathBuf,
}

impl LocalBackupStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn partition_dir(&self, partition_id: u32) -> PathBuf {
        self.root.join(format!("partition-{}", partition_id))
    }

    fn write(&self, backup: &Backup) -> Result<(), BackupError> {
        let partition_dir = self.partition_dir(backup.descriptor.partition_id);
        let target = partition_dir.join(backup.descriptor.checkpoint_id.to_string());
        let tmp = partition_dir.join(format!(".{}.tmp", backup.descriptor.checkpoint_id));
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(tmp.join(SNAPSHOT_DIR))?;

        for (name, data) in &backup.snapshot_files {
            fs::write(tmp.join(SNAPSHOT_DIR).join(name), data)?;
        }
        let mut log = fs::File::create(tmp.join(LOG_FILE))?;
        for record in &backup.records {
            serde_json::to_writer(&mut log, record)?;
            log.write_all(b"\n")?;
        }
        log.sync_all()?;
        fs::write(tmp.join(MANIFEST_FILE), serde_json::to_vec_pretty(&backup.descriptor)?)?;

        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn read(&self, partition_id: u32, checkpoint_id: i64) -> Result<Backup, BackupError> {
        let dir = self.partition_dir(partition_id).join(checkpoint_id.to_string());
        if !dir.join(MANIFEST_FILE).exists() {
            return Err(BackupError::NotFound {
                partition_id,
                checkpoint_id,
            });
        }
        let descriptor: BackupDescriptor = serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE))?)?;

        let mut snapshot_files = Vec::new();
        for entry in fs::read_dir(dir.join(SNAPSHOT_DIR))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            snapshot_files.push((name, Bytes::from(fs::read(entry.path())?)));
        }
        snapshot_files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut records = Vec::new();
        for line in BufReader::new(fs::File::open(dir.join(LOG_FILE))?).lines() {
            let line = line?;
            if !line.is_empty() {
                records.push(serde_json::from_str::<Record>(&line)?);
            }
        }
        Ok(Backup {
            descriptor,
            snapshot_files,
            records,
        })
    }

    fn descriptors(&self, partition_id: u32) -> Result<Vec<BackupDescriptor>, BackupError> {
        let dir = self.partition_dir(partition_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut descriptors = Vec::new();
        for entry in fs::read_dir(dir)? {
            let manifest = entry?.path().join(MANIFEST_FILE);
            if manifest.exists() {
                descriptors.push(serde_json::from_slice::<BackupDescriptor>(&fs::read(manifest)?)?);
            }
        }
        descriptors.sort_by_key(|d| d.checkpoint_id);
        Ok(descriptors)
    }
}

#[async_trait]
impl BackupStore for LocalBackupStore {
    async fn save(&self, backup: Backup) -> Result<(), BackupError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.write(&backup))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }

    async fn load(&self, partition_id: u32, checkpoint_id: i64) -> Result<Backup, BackupError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read(partition_id, checkpoint_id))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }

    async fn list(&self, partition_id: u32) -> Result<Vec<BackupDescriptor>, BackupError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.descriptors(partition_id))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CheckpointValue, Intent, RecordValue};

    fn backup(checkpoint_id: i64) -> Backup {
        let mut record = Record::command(
            1,
            Intent::Create,
            RecordValue::Checkpoint(CheckpointValue {
                checkpoint_id,
                checkpoint_position: -1,
            }),
        );
        record.position = 7;
        Backup {
            descriptor: BackupDescriptor {
                partition_id: 1,
                node_id: 2,
                checkpoint_id,
                checkpoint_position: 7,
                snapshot_id: Some("3-1-5-5".into()),
                log_start_position: 5,
                record_count: 1,
            },
            snapshot_files: vec![
                ("CHECKSUM".into(), Bytes::from_static(b"abc")),
                ("state.sst".into(), Bytes::from_static(b"data")),
            ],
            records: vec![record],
        }
    }

    #[tokio::test]
    async fn test_save_load_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBackupStore::new(dir.path());
        store.save(backup(10)).await.unwrap();
        store.save(backup(4)).await.unwrap();

        assert_eq!(store.load(1, 10).await.unwrap(), backup(10));
        let listed: Vec<i64> = store.list(1).await.unwrap().iter().map(|d| d.checkpoint_id).collect();
        assert_eq!(listed, vec![4, 10]);
        assert!(store.list(2).await.unwrap().is_empty());
        assert!(matches!(
            store.load(1, 11).await,
            Err(BackupError::NotFound { checkpoint_id: 11, .. })
        ));
    }
}
