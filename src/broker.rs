//! A broker: the partitions hosted on one node and the public API
//!
//! The broker opens a [`Partition`] for every partition the [`Topology`]
//! assigns to its node, shares one peer transport and [`ClusterRouter`]
//! between them, and exposes command ingress, exporter and backup access and
//! the cluster membership operations.

use crate::actor::ActorScheduler;
use crate::backup::{BackupDescriptor, BackupError, BackupService, BackupServiceConfig, BackupStore, CheckpointCommands, LocalBackupStore};
use crate::config::{BrokerConfig, ConfigError};
use crate::engine::StreamClock;
use crate::exporter::{ExporterError, ExporterFeed};
use crate::health::HealthReport;
use crate::logstream::{LogAppender, LogStreamError, LogStreamWriter};
use crate::partition::{Partition, PartitionConfig, PartitionError, PartitionLayout, PartitionServices, Topology, TransportCommandSender};
use crate::protocol::{CheckpointValue, Intent, Record, RecordValue};
use crate::raft::server::StatusProvider;
use crate::raft::{ClusterRouter, ConfigChange, MessageSender, NodeId, RaftError, RaftHandle, Transport, TransportLayer};
use crate::snapshot::{SnapshotError, SnapshotMetadata};
use crate::stream::ResponseSink;
use async_trait::async_trait;
use slog::{info, o, warn, Logger};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};

/// Why a command was not accepted or not answered.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("partition {0} is not hosted on this broker")]
    UnknownPartition(u32),

    #[error("not the leader of partition {partition_id} (leader: {leader:?})")]
    NotLeader { partition_id: u32, leader: Option<NodeId> },

    #[error("partition {0} has too many commands in flight")]
    Backpressure(u32),

    #[error("no response from partition {0} in time")]
    Timeout(u32),

    #[error("failed to append the command: {0}")]
    Append(LogStreamError),

    #[error("the partition stopped before answering")]
    Closed,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Exporter(#[from] ExporterError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("partition {0} is not hosted on this broker")]
    UnknownPartition(u32),

    #[error("not the leader of partition {partition_id} (leader: {leader:?})")]
    NotLeader { partition_id: u32, leader: Option<NodeId> },

    #[error("no backup store configured")]
    NoBackupStore,
}

/// A client command for one partition.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandRequest {
    /// Key of the entity the command targets; -1 lets the partition assign one.
    pub key: i64,
    pub intent: Intent,
    pub value: RecordValue,
}

impl CommandRequest {
    pub fn new(intent: Intent, value: RecordValue) -> Self {
        Self { key: -1, intent, value }
    }

    pub fn with_key(mut self, key: i64) -> Self {
        self.key = key;
        self
    }
}

/// The record answering a command.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandResponse {
    Event(Record),
    Rejected(Record),
}

impl CommandResponse {
    pub fn record(&self) -> &Record {
        match self {
            CommandResponse::Event(record) | CommandResponse::Rejected(record) => record,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandResponse::Rejected(_))
    }
}

/// Clients waiting for the answer to their command, keyed by request id.
pub struct ResponseRegistry {
    stream_id: i32,
    next_request_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<Record>>>,
}

impl ResponseRegistry {
    pub fn new(stream_id: i32) -> Self {
        Self {
            stream_id,
            next_request_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    fn register(&self) -> (i64, oneshot::Receiver<Record>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(request_id, tx);
        (request_id, rx)
    }

    fn forget(&self, request_id: i64) {
        self.lock().remove(&request_id);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, oneshot::Sender<Record>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResponseSink for ResponseRegistry {
    fn respond(&self, request_stream_id: i32, request_id: i64, response: Record) {
        // answers for requests accepted by an earlier leader on another broker
        if request_stream_id != self.stream_id {
            return;
        }
        if let Some(waiter) = self.lock().remove(&request_id) {
            let _ = waiter.send(response);
        }
    }
}

struct IngressPoint {
    raft: RaftHandle,
    writer: LogStreamWriter,
    in_flight: Arc<Semaphore>,
}

/// Appends client commands and waits for their answers.
#[derive(Clone)]
struct CommandIngress {
    points: Arc<BTreeMap<u32, IngressPoint>>,
    responses: Arc<ResponseRegistry>,
    request_timeout: Duration,
}

impl CommandIngress {
    async fn submit(&self, partition_id: u32, request: CommandRequest) -> Result<CommandResponse, IngressError> {
        let point = self
            .points
            .get(&partition_id)
            .ok_or(IngressError::UnknownPartition(partition_id))?;
        if !point.raft.is_leader() {
            return Err(IngressError::NotLeader {
                partition_id,
                leader: point.raft.leader(),
            });
        }
        let _permit = point
            .in_flight
            .clone()
            .try_acquire_owned()
            .map_err(|_| IngressError::Backpressure(partition_id))?;

        let (request_id, answer) = self.responses.register();
        let mut command = Record::command(request.key, request.intent, request.value)
            .with_request(self.responses.stream_id(), request_id);
        command.partition_id = partition_id;

        if let Err(e) = point.writer.append(vec![command]).await {
            self.responses.forget(request_id);
            return Err(match e {
                LogStreamError::Append(RaftError::NotLeader { leader }) => IngressError::NotLeader { partition_id, leader },
                e => IngressError::Append(e),
            });
        }

        match tokio::time::timeout(self.request_timeout, answer).await {
            Ok(Ok(record)) if record.is_rejection() => Ok(CommandResponse::Rejected(record)),
            Ok(Ok(record)) => Ok(CommandResponse::Event(record)),
            Ok(Err(_)) => Err(IngressError::Closed),
            Err(_) => {
                self.responses.forget(request_id);
                Err(IngressError::Timeout(partition_id))
            }
        }
    }
}

/// Creates checkpoints through the broker's own command ingress.
struct IngressCheckpoints {
    ingress: CommandIngress,
    partition_id: u32,
}

#[async_trait]
impl CheckpointCommands for IngressCheckpoints {
    async fn create_checkpoint(&self, checkpoint_id: i64) -> Result<Record, BackupError> {
        let request = CommandRequest::new(
            Intent::Create,
            RecordValue::Checkpoint(CheckpointValue {
                checkpoint_id,
                checkpoint_position: -1,
            }),
        );
        self.ingress
            .submit(self.partition_id, request)
            .await
            .map(|response| response.record().clone())
            .map_err(|e| BackupError::Submit(e.to_string()))
    }
}

pub struct Broker {
    config: BrokerConfig,
    topology: Topology,
    partitions: BTreeMap<u32, Partition>,
    ingress: CommandIngress,
    router: ClusterRouter,
    backups: Option<Arc<dyn BackupStore>>,
    logger: Logger,
}

impl Broker {
    /// Open every partition assigned to this node and start its actors.
    ///
    /// Incoming peer messages must be handed to [`Broker::router`] by the
    /// server layer.
    pub async fn start(
        config: BrokerConfig,
        scheduler: &ActorScheduler,
        message_sender: Arc<dyn MessageSender>,
        clock: Arc<dyn StreamClock>,
        logger: Logger,
    ) -> Result<Self, BrokerError> {
        config.validate()?;
        let logger = logger.new(o!("node" => config.node_id));
        let members: Vec<NodeId> = config.members.iter().map(|m| m.node_id).collect();
        let topology = Topology::round_robin(&members, config.partition_count, config.replication_factor);

        let transport = Arc::new(TransportLayer::new(message_sender));
        for (node_id, address) in config.member_addresses() {
            transport.add_peer(node_id, address).await;
        }
        let transport: Arc<dyn Transport> = transport;
        let router = ClusterRouter::new();
        let responses = Arc::new(ResponseRegistry::new(config.node_id as i32));
        let services = PartitionServices {
            transport: transport.clone(),
            router: router.clone(),
            clock,
            sender: Arc::new(TransportCommandSender::new(
                config.node_id,
                topology.clone(),
                transport,
                scheduler.handle(),
                logger.clone(),
            )),
            responses: responses.clone(),
        };

        let mut partitions = BTreeMap::new();
        let mut points = BTreeMap::new();
        for partition_id in topology.partitions_of(config.node_id) {
            let partition = Partition::open(
                scheduler,
                PartitionConfig {
                    partition_id,
                    node_id: config.node_id,
                    replicas: topology.replicas(partition_id).to_vec(),
                    partition_ids: topology.partition_ids(),
                    layout: PartitionLayout::new(&config.data_dir, partition_id),
                    raft: config.raft.clone(),
                    processing: config.processing.clone(),
                    snapshot: config.snapshot.clone(),
                    exporters: config.exporters.clone(),
                },
                services.clone(),
                logger.clone(),
            )?;
            points.insert(
                partition_id,
                IngressPoint {
                    raft: partition.raft().clone(),
                    writer: LogStreamWriter::new(partition.raft().clone()),
                    in_flight: Arc::new(Semaphore::new(config.processing.max_in_flight_commands)),
                },
            );
            partitions.insert(partition_id, partition);
        }

        let backups = config
            .backup_dir
            .as_ref()
            .map(|dir| Arc::new(LocalBackupStore::new(dir)) as Arc<dyn BackupStore>);
        info!(logger, "Broker started";
            "partitions" => ?partitions.keys().collect::<Vec<_>>(), "members" => members.len());

        Ok(Self {
            ingress: CommandIngress {
                points: Arc::new(points),
                responses,
                request_timeout: Duration::from_millis(config.processing.request_timeout_ms),
            },
            config,
            topology,
            partitions,
            router,
            backups,
            logger,
        })
    }

    /// Replace the backup destination.
    pub fn with_backup_store(mut self, store: Arc<dyn BackupStore>) -> Self {
        self.backups = Some(store);
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Routes incoming peer messages to the local partitions.
    pub fn router(&self) -> ClusterRouter {
        self.router.clone()
    }

    /// Ids of the partitions hosted here.
    pub fn partition_ids(&self) -> Vec<u32> {
        self.partitions.keys().copied().collect()
    }

    pub fn partition(&self, partition_id: u32) -> Option<&Partition> {
        self.partitions.get(&partition_id)
    }

    fn hosted(&self, partition_id: u32) -> Result<&Partition, BrokerError> {
        self.partitions
            .get(&partition_id)
            .ok_or(BrokerError::UnknownPartition(partition_id))
    }

    fn leading(&self, partition_id: u32) -> Result<&Partition, BrokerError> {
        let partition = self.hosted(partition_id)?;
        if !partition.raft().is_leader() {
            return Err(BrokerError::NotLeader {
                partition_id,
                leader: partition.raft().leader(),
            });
        }
        Ok(partition)
    }

    /// Append a command to `partition_id` and wait for the record answering it.
    pub async fn submit_command(&self, partition_id: u32, request: CommandRequest) -> Result<CommandResponse, IngressError> {
        self.ingress.submit(partition_id, request).await
    }

    /// The leader of `partition_id` as known by the local replica.
    pub fn partition_leader(&self, partition_id: u32) -> Result<Option<NodeId>, BrokerError> {
        Ok(self.hosted(partition_id)?.raft().leader())
    }

    pub fn partition_health(&self, partition_id: u32) -> Result<HealthReport, BrokerError> {
        Ok(self.hosted(partition_id)?.health().report_snapshot())
    }

    /// Add `node_id` as a voter of `partition_id`. Leader only; returns the
    /// index of the configuration entry.
    pub async fn add_replica(&self, partition_id: u32, node_id: NodeId) -> Result<u64, BrokerError> {
        let index = self
            .leading(partition_id)?
            .raft()
            .change_config(ConfigChange::AddVoter(node_id))
            .await?;
        info!(self.logger, "Added replica"; "partition" => partition_id, "replica" => node_id, "index" => index);
        Ok(index)
    }

    pub async fn remove_replica(&self, partition_id: u32, node_id: NodeId) -> Result<u64, BrokerError> {
        let index = self
            .leading(partition_id)?
            .raft()
            .change_config(ConfigChange::RemoveVoter(node_id))
            .await?;
        info!(self.logger, "Removed replica"; "partition" => partition_id, "replica" => node_id, "index" => index);
        Ok(index)
    }

    pub async fn transfer_leadership(&self, partition_id: u32, target: NodeId) -> Result<(), BrokerError> {
        self.leading(partition_id)?.raft().transfer_leadership(target).await?;
        Ok(())
    }

    /// Snapshot `partition_id` now instead of waiting for the next period.
    pub async fn take_snapshot(&self, partition_id: u32) -> Result<Option<SnapshotMetadata>, BrokerError> {
        Ok(self.hosted(partition_id)?.snapshot_director().take_snapshot().await?)
    }

    /// The exporter feed of a partition led by this broker.
    pub fn exporter_feed(&self, partition_id: u32) -> Result<ExporterFeed, BrokerError> {
        let partition = self.leading(partition_id)?;
        partition.exporter_feed().ok_or(BrokerError::NotLeader {
            partition_id,
            leader: partition.raft().leader(),
        })
    }

    /// Checkpoint `partition_id` and back it up. Leader only.
    pub async fn take_backup(&self, partition_id: u32, checkpoint_id: i64) -> Result<BackupDescriptor, BrokerError> {
        let partition = self.leading(partition_id)?;
        let store = self.backups.clone().ok_or(BrokerError::NoBackupStore)?;
        let service = BackupService::new(
            BackupServiceConfig::new(partition_id, self.config.node_id),
            Arc::new(IngressCheckpoints {
                ingress: self.ingress.clone(),
                partition_id,
            }),
            partition.snapshot_store().clone(),
            partition.raft().storage(),
            partition.raft().subscribe_commit(),
            partition.compaction_pins().clone(),
            store,
            partition.health().clone(),
            self.logger.clone(),
        );
        Ok(service.take_backup(checkpoint_id).await?)
    }

    pub fn backup_store(&self) -> Option<Arc<dyn BackupStore>> {
        self.backups.clone()
    }

    /// Body of the `/health` endpoint: role and health per partition.
    pub fn status_provider(&self) -> StatusProvider {
        let partitions: Vec<_> = self
            .partitions
            .values()
            .map(|p| (p.partition_id(), p.raft().clone(), p.health().clone()))
            .collect();
        let node_id = self.config.node_id;
        Arc::new(move || {
            let partitions: Vec<serde_json::Value> = partitions
                .iter()
                .map(|(partition_id, raft, health)| {
                    serde_json::json!({
                        "partition_id": partition_id,
                        "role": raft.role(),
                        "commit": raft.commit(),
                        "health": health.report_snapshot(),
                    })
                })
                .collect();
            serde_json::json!({ "node_id": node_id, "partitions": partitions })
        })
    }

    pub async fn shutdown(&self) {
        info!(self.logger, "Shutting down broker");
        for partition in self.partitions.values() {
            partition.shutdown().await;
        }
        if self.ingress.responses.pending() > 0 {
            warn!(self.logger, "Dropping unanswered commands"; "count" => self.ingress.responses.pending());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InstanceValue;

    #[test]
    fn test_responses_reach_only_their_waiter() {
        let registry = ResponseRegistry::new(3);
        let (first, mut first_rx) = registry.register();
        let (second, mut second_rx) = registry.register();
        assert_ne!(first, second);

        let answer = Record::command(1, Intent::Created, RecordValue::Instance(InstanceValue::default()));
        registry.respond(4, second, answer.clone());
        assert_eq!(registry.pending(), 2);

        registry.respond(3, second, answer.clone());
        assert_eq!(second_rx.try_recv().unwrap(), answer);
        assert!(first_rx.try_recv().is_err());

        registry.forget(first);
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_command_response_kind() {
        let mut record = Record::command(1, Intent::Create, RecordValue::Instance(InstanceValue::default()));
        assert!(!CommandResponse::Event(record.clone()).is_rejected());
        record.record_type = crate::protocol::RecordType::CommandRejection;
        let rejected = CommandResponse::Rejected(record.clone());
        assert!(rejected.is_rejected());
        assert_eq!(rejected.record(), &record);
    }
}
