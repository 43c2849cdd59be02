use super::{Backup, BackupDescriptor, BackupError, BackupStore};
use crate::actor::RetryStrategy;
use crate::health::{Fault, HealthMonitor};
use crate::logstream::LogStreamReader;
use crate::protocol::{Intent, Record, RecordValue};
use crate::raft::node::CommitWatermark;
use crate::raft::storage::LogStorage;
use crate::snapshot::{CompactionPins, FileBasedSnapshotStore, PersistedSnapshot};
use async_trait::async_trait;
use bytes::Bytes;
use slog::{info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Appends `CHECKPOINT:CREATE` to the partition and waits for the result.
#[async_trait]
pub trait CheckpointCommands: Send + Sync {
    /// The record answering the command: the `CREATED`/`IGNORED` event or a rejection.
    async fn create_checkpoint(&self, checkpoint_id: i64) -> Result<Record, BackupError>;
}

#[derive(Clone, Debug)]
pub struct BackupServiceConfig {
    pub partition_id: u32,
    pub node_id: u64,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_attempts: u32,
}

impl BackupServiceConfig {
    pub fn new(partition_id: u32, node_id: u64) -> Self {
        Self {
            partition_id,
            node_id,
            retry_delay: Duration::from_millis(200),
            max_retry_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// Takes backups of one partition on its leader.
#[derive(Clone)]
pub struct BackupService {
    config: BackupServiceConfig,
    commands: Arc<dyn CheckpointCommands>,
    snapshots: FileBasedSnapshotStore,
    storage: Arc<dyn LogStorage>,
    commit: watch::Receiver<CommitWatermark>,
    pins: CompactionPins,
    store: Arc<dyn BackupStore>,
    health: HealthMonitor,
    logger: Logger,
}

impl BackupService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BackupServiceConfig,
        commands: Arc<dyn CheckpointCommands>,
        snapshots: FileBasedSnapshotStore,
        storage: Arc<dyn LogStorage>,
        commit: watch::Receiver<CommitWatermark>,
        pins: CompactionPins,
        store: Arc<dyn BackupStore>,
        health: HealthMonitor,
        logger: Logger,
    ) -> Self {
        let logger = logger.new(o!("partition" => config.partition_id));
        Self {
            config,
            commands,
            snapshots,
            storage,
            commit,
            pins,
            store,
            health,
            logger,
        }
    }

    pub fn store(&self) -> &Arc<dyn BackupStore> {
        &self.store
    }

    /// Checkpoint the partition and back it up as of the checkpoint position.
    pub async fn take_backup(&self, checkpoint_id: i64) -> Result<BackupDescriptor, BackupError> {
        // Both are taken before the checkpoint is appended: the log stays as
        // it is and the reserved snapshot cannot be deleted by a newer one.
        let _pin = self.pins.pin(self.storage.boundary().position);
        let reservation = self.snapshots.reserve_latest();
        let checkpoint_position = self.checkpoint(checkpoint_id).await?;

        let snapshot = reservation
            .as_ref()
            .map(|r| r.snapshot().clone())
            .filter(|s| s.metadata.id.processed_position <= checkpoint_position);
        let start = match &snapshot {
            Some(snapshot) => snapshot.metadata.compaction_position(),
            None if self.storage.boundary().index == 0 => -1,
            None => return Err(BackupError::NoUsableSnapshot(checkpoint_position)),
        };

        let backup = self.collect(snapshot, start, checkpoint_id, checkpoint_position).await?;
        let descriptor = backup.descriptor.clone();

        let mut retry = RetryStrategy::new(self.config.retry_delay, self.config.max_retry_delay);
        let result = retry
            .run(self.config.max_attempts, || {
                let backup = backup.clone();
                async move {
                    let saved = self.store.save(backup).await;
                    if let Err(e) = &saved {
                        warn!(self.logger, "Failed to save backup"; "checkpoint" => checkpoint_id, "error" => %e);
                        self.health.record_fault(Fault::Backup);
                    }
                    saved
                }
            })
            .await;
        result?;
        info!(self.logger, "Took backup";
            "checkpoint" => checkpoint_id, "position" => checkpoint_position,
            "snapshot" => ?descriptor.snapshot_id, "records" => descriptor.record_count);
        Ok(descriptor)
    }

    async fn checkpoint(&self, checkpoint_id: i64) -> Result<i64, BackupError> {
        let record = self.commands.create_checkpoint(checkpoint_id).await?;
        if record.is_rejection() {
            return Err(BackupError::CheckpointRejected {
                checkpoint_id,
                reason: record.rejection_reason,
            });
        }
        match (record.intent, record.value) {
            (Intent::Created, RecordValue::Checkpoint(value)) => Ok(value.checkpoint_position),
            (Intent::Ignored, _) => Err(BackupError::StaleCheckpoint(checkpoint_id)),
            (intent, _) => Err(BackupError::CheckpointRejected {
                checkpoint_id,
                reason: format!("unexpected answer {:?}", intent),
            }),
        }
    }

    /// Read the snapshot files and the records in `(start, checkpoint_position]`.
    async fn collect(
        &self,
        snapshot: Option<PersistedSnapshot>,
        start: i64,
        checkpoint_id: i64,
        checkpoint_position: i64,
    ) -> Result<Backup, BackupError> {
        let snapshots = self.snapshots.clone();
        let mut reader = LogStreamReader::new(self.storage.clone(), self.commit.clone());
        let config = self.config.clone();
        let work = move || -> Result<Backup, BackupError> {
            let snapshot_files: Vec<(String, Bytes)> = match &snapshot {
                Some(snapshot) => snapshots.files(snapshot)?,
                None => Vec::new(),
            };
            reader.seek_after(start)?;
            let mut records = Vec::new();
            while let Some(record) = reader.next_record()? {
                if record.position > checkpoint_position {
                    break;
                }
                records.push(record);
            }
            Ok(Backup {
                descriptor: BackupDescriptor {
                    partition_id: config.partition_id,
                    node_id: config.node_id,
                    checkpoint_id,
                    checkpoint_position,
                    snapshot_id: snapshot.map(|s| s.id().to_string()),
                    log_start_position: start,
                    record_count: records.len(),
                },
                snapshot_files,
                records,
            })
        };
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::LocalBackupStore;
    use crate::logging::test_logger;
    use crate::logstream::encode_batch;
    use crate::protocol::{CheckpointValue, InstanceValue, RejectionType};
    use crate::raft::entry::{Configuration, EntryPayload, LogBoundary, LogEntry};
    use crate::raft::storage::MemLogStorage;
    use std::fs;
    use std::path::Path;

    /// Answers every checkpoint as processed at `position`.
    struct FixedCheckpoint {
        position: i64,
        reject: bool,
    }

    #[async_trait]
    impl CheckpointCommands for FixedCheckpoint {
        async fn create_checkpoint(&self, checkpoint_id: i64) -> Result<Record, BackupError> {
            let mut record = checkpoint_created(checkpoint_id, self.position);
            if self.reject {
                record.rejection_type = Some(RejectionType::InvalidState);
                record.record_type = crate::protocol::RecordType::CommandRejection;
                record.rejection_reason = "nope".into();
            }
            Ok(record)
        }
    }

    fn checkpoint_created(checkpoint_id: i64, position: i64) -> Record {
        Record::command(
            1,
            Intent::Created,
            RecordValue::Checkpoint(CheckpointValue {
                checkpoint_id,
                checkpoint_position: position,
            }),
        )
    }

    /// Persists a snapshot newer than the checkpoint while the checkpoint is
    /// being processed.
    struct SnapshotDuringCheckpoint {
        snapshots: FileBasedSnapshotStore,
        position: i64,
    }

    #[async_trait]
    impl CheckpointCommands for SnapshotDuringCheckpoint {
        async fn create_checkpoint(&self, checkpoint_id: i64) -> Result<Record, BackupError> {
            persist_snapshot(&self.snapshots, self.position + 1, 5);
            Ok(checkpoint_created(checkpoint_id, self.position))
        }
    }

    fn persist_snapshot(snapshots: &FileBasedSnapshotStore, position: i64, index: u64) -> PersistedSnapshot {
        snapshots
            .take_transient(position, position, |dir| {
                fs::create_dir_all(dir)?;
                fs::write(dir.join("state.sst"), position.to_string())?;
                Ok(())
            })
            .unwrap()
            .persist(
                LogBoundary {
                    index,
                    term: 1,
                    position,
                },
                Configuration::new([1]),
                position,
            )
            .unwrap()
    }

    fn service(dir: &Path, checkpoint: FixedCheckpoint) -> BackupService {
        let snapshots = FileBasedSnapshotStore::open(dir.join("snapshots"), 1024, test_logger()).unwrap();
        service_over(dir, Arc::new(checkpoint), snapshots, log_of_six())
    }

    /// One record per entry at positions 1 to 6, all committed.
    fn log_of_six() -> Arc<MemLogStorage> {
        let storage = Arc::new(MemLogStorage::new(Configuration::new([1])));
        for position in 1..=6i64 {
            let record = Record::command(-1, Intent::Create, RecordValue::Instance(InstanceValue::default()));
            storage
                .append(&[LogEntry {
                    index: position as u64,
                    term: 1,
                    payload: EntryPayload::Application {
                        lowest_position: position,
                        highest_position: position,
                        data: encode_batch(&[record]).unwrap(),
                    },
                }])
                .unwrap();
        }
        storage
    }

    fn service_over(
        dir: &Path,
        commands: Arc<dyn CheckpointCommands>,
        snapshots: FileBasedSnapshotStore,
        storage: Arc<MemLogStorage>,
    ) -> BackupService {
        let (_, commit) = watch::channel(CommitWatermark { index: 6, position: 6 });
        BackupService::new(
            BackupServiceConfig::new(1, 1),
            commands,
            snapshots,
            storage,
            commit,
            CompactionPins::new(),
            Arc::new(LocalBackupStore::new(dir.join("backups"))),
            HealthMonitor::new(test_logger()),
            test_logger(),
        )
    }

    #[tokio::test]
    async fn test_backup_without_snapshot_carries_the_log_up_to_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(
            dir.path(),
            FixedCheckpoint {
                position: 4,
                reject: false,
            },
        );
        let descriptor = service.take_backup(3).await.unwrap();
        assert_eq!(descriptor.snapshot_id, None);
        assert_eq!(descriptor.checkpoint_position, 4);
        assert_eq!(descriptor.record_count, 4);

        let backup = service.store().load(1, 3).await.unwrap();
        assert_eq!(backup.records.iter().map(|r| r.position).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(backup.snapshot_files.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_checkpoint_fails_the_backup() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(
            dir.path(),
            FixedCheckpoint {
                position: 4,
                reject: true,
            },
        );
        assert!(matches!(
            service.take_backup(3).await,
            Err(BackupError::CheckpointRejected { checkpoint_id: 3, .. })
        ));
        assert!(service.store().list(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_persisted_during_checkpoint_does_not_steal_the_backup_base() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = FileBasedSnapshotStore::open(dir.path().join("snapshots"), 1024, test_logger()).unwrap();
        let base = persist_snapshot(&snapshots, 2, 2);
        let storage = log_of_six();
        storage.compact(2).unwrap();

        let service = service_over(
            dir.path(),
            Arc::new(SnapshotDuringCheckpoint {
                snapshots: snapshots.clone(),
                position: 4,
            }),
            snapshots.clone(),
            storage,
        );
        let descriptor = service.take_backup(7).await.unwrap();
        assert_eq!(descriptor.snapshot_id, Some(base.id().to_string()));
        assert_eq!(descriptor.log_start_position, 2);
        assert_eq!(descriptor.checkpoint_position, 4);

        let backup = service.store().load(1, 7).await.unwrap();
        assert_eq!(backup.records.iter().map(|r| r.position).collect::<Vec<_>>(), vec![3, 4]);
        assert!(!backup.snapshot_files.is_empty());
        assert_eq!(snapshots.latest().unwrap().metadata.id.processed_position, 5);
    }
}
