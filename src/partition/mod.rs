//! One partition replica on a broker
//!
//! A [`Partition`] wires the Raft node, the snapshot store and director, and
//! a controller actor that keeps the stream processor in line with the
//! replica's role. On disk a partition
//! lives in `<data_dir>/partition-<id>/` with `raft/`, `runtime/` and
//! `snapshots/` below it.

mod controller;
mod sender;
mod topology;

pub use self::controller::ControllerMessage;
pub use self::sender::TransportCommandSender;
pub use self::topology::Topology;

use self::controller::{ControllerContext, PartitionController, MAILBOX_CAPACITY};
use crate::actor::{ActorRef, ActorScheduler};
use crate::config::{ExporterConfig, ProcessingConfig, RaftConfig, SnapshotConfig};
use crate::engine::{Engine, InterPartitionCommandSender, StreamClock};
use crate::exporter::ExporterFeed;
use crate::health::HealthMonitor;
use crate::raft::{
    ClusterRouter, Configuration, CoreConfig, NodeId, RaftHandle, RaftNode, RaftNodeConfig, RocksLogStorage,
    StorageError, Transport,
};
use crate::snapshot::{
    CompactionPins, FileBasedSnapshotStore, SnapshotDirector, SnapshotDirectorConfig, SnapshotDirectorHandle,
    SnapshotError,
};
use crate::state::StateError;
use crate::stream::{ResponseSink, StreamProcessorHandle, StreamProcessorMode};
use slog::{info, o, Logger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("partition I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Directories of one partition replica.
#[derive(Clone, Debug)]
pub struct PartitionLayout {
    root: PathBuf,
}

impl PartitionLayout {
    pub fn new<P: AsRef<Path>>(data_dir: P, partition_id: u32) -> Self {
        Self {
            root: data_dir.as_ref().join(format!("partition-{}", partition_id)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raft(&self) -> PathBuf {
        self.root.join("raft")
    }

    pub fn runtime(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn snapshots(&self) -> PathBuf {
        self.root.join("snapshots")
    }
}

#[derive(Clone, Debug)]
pub struct PartitionConfig {
    pub partition_id: u32,
    pub node_id: NodeId,
    /// Initial voters, used only when the log is created.
    pub replicas: Vec<NodeId>,
    /// Every partition of the cluster, for command distribution.
    pub partition_ids: Vec<u32>,
    pub layout: PartitionLayout,
    pub raft: RaftConfig,
    pub processing: ProcessingConfig,
    pub snapshot: SnapshotConfig,
    pub exporters: ExporterConfig,
}

/// Shared collaborators handed to every partition of a broker.
#[derive(Clone)]
pub struct PartitionServices {
    pub transport: Arc<dyn Transport>,
    pub router: ClusterRouter,
    pub clock: Arc<dyn StreamClock>,
    pub sender: Arc<dyn InterPartitionCommandSender>,
    pub responses: Arc<dyn ResponseSink>,
}

/// A running partition replica.
pub struct Partition {
    partition_id: u32,
    raft: RaftHandle,
    controller: ActorRef<ControllerMessage>,
    snapshot_director: SnapshotDirectorHandle,
    snapshots: FileBasedSnapshotStore,
    pins: CompactionPins,
    processor: watch::Receiver<Option<StreamProcessorHandle>>,
    exporter: watch::Receiver<Option<ExporterFeed>>,
    router: ClusterRouter,
    health: HealthMonitor,
    logger: Logger,
}

impl Partition {
    /// Open the partition's stores and start its actors.
    pub fn open(
        scheduler: &ActorScheduler,
        config: PartitionConfig,
        services: PartitionServices,
        logger: Logger,
    ) -> Result<Self, PartitionError> {
        let partition_id = config.partition_id;
        let logger = logger.new(o!("partition" => partition_id, "node" => config.node_id));
        let health = HealthMonitor::new(logger.clone());
        std::fs::create_dir_all(config.layout.root())?;

        let snapshots =
            FileBasedSnapshotStore::open(config.layout.snapshots(), config.raft.snapshot_chunk_size, logger.clone())?;
        let storage = Arc::new(RocksLogStorage::open_or_create(
            config.layout.raft(),
            config.node_id,
            Configuration::new(config.replicas.iter().copied()),
        )?);
        let raft = RaftNode::spawn(
            scheduler,
            RaftNodeConfig {
                partition_id,
                core: CoreConfig::from_raft_config(config.node_id, &config.raft),
                tick_interval: config.raft.tick_interval(),
            },
            storage,
            Arc::new(snapshots.clone()),
            services.transport.clone(),
            health.clone(),
            logger.clone(),
        )?;
        services.router.register_partition(partition_id, raft.actor());

        let (processor_tx, processor) = watch::channel(None);
        let (exporter_tx, exporter) = watch::channel(None);
        let pins = CompactionPins::new();

        let snapshot_director = SnapshotDirector::spawn(
            scheduler,
            SnapshotDirectorConfig::new(partition_id, &config.snapshot, config.exporters.ids.clone()),
            snapshots.clone(),
            Arc::new(raft.clone()),
            processor.clone(),
            pins.clone(),
            health.clone(),
            logger.clone(),
        );

        let controller = PartitionController::new(
            ControllerContext {
                partition_id,
                scheduler: scheduler.share(),
                raft: raft.clone(),
                store: snapshots.clone(),
                runtime_dir: config.layout.runtime(),
                engine: Engine::new(partition_id, config.partition_ids.clone(), services.clock.clone()),
                processing: config.processing.clone(),
                exporters: config.exporters.clone(),
                sender: services.sender.clone(),
                responses: services.responses.clone(),
                processor_tx,
                exporter_tx,
                health: health.clone(),
            },
            logger.clone(),
        );
        let controller = scheduler.spawn(controller, MAILBOX_CAPACITY);
        info!(logger, "Partition opened"; "replicas" => ?config.replicas);

        Ok(Self {
            partition_id,
            raft,
            controller,
            snapshot_director,
            snapshots,
            pins,
            processor,
            exporter,
            router: services.router,
            health,
            logger,
        })
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn snapshot_store(&self) -> &FileBasedSnapshotStore {
        &self.snapshots
    }

    pub fn compaction_pins(&self) -> &CompactionPins {
        &self.pins
    }

    pub fn snapshot_director(&self) -> &SnapshotDirectorHandle {
        &self.snapshot_director
    }

    /// The current stream processor, if the runtime is installed.
    pub fn processor(&self) -> Option<StreamProcessorHandle> {
        self.processor.borrow().clone()
    }

    /// The exporter feed; only the leader has one.
    pub fn exporter_feed(&self) -> Option<ExporterFeed> {
        self.exporter.borrow().clone()
    }

    /// Wait until a processor in `mode` is installed.
    pub async fn wait_for_processor(&self, mode: StreamProcessorMode, timeout: Duration) -> Option<StreamProcessorHandle> {
        let mut rx = self.processor.clone();
        let installed = tokio::time::timeout(
            timeout,
            rx.wait_for(|p| p.as_ref().is_some_and(|p| p.mode() == mode)),
        )
        .await;
        match installed {
            Ok(Ok(handle)) => handle.as_ref().cloned(),
            _ => None,
        }
    }

    /// Stop the partition's actors, the runtime first and Raft last.
    pub async fn shutdown(&self) {
        self.controller.stop_and_wait().await;
        self.snapshot_director.stop().await;
        self.router.unregister_partition(self.partition_id);
        self.raft.shutdown().await;
        info!(self.logger, "Partition closed");
    }
}
