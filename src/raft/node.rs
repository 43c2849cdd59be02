//! Raft node actor
//!
//! Wraps a [`RaftCore`] in an actor: ticks arrive from a fixed-rate timer,
//! peer messages from the [`ClusterRouter`](super::ClusterRouter), requests
//! from a [`RaftHandle`]. After every message the node ships the core's
//! outgoing messages through the transport and publishes role and commit
//! changes.

use crate::actor::{Actor, ActorControl, ActorError, ActorRef, ActorScheduler, HandlerResult, TimerHandle};
use crate::health::{Fault, HealthMonitor, HealthStatus};
use crate::raft::core::{CoreConfig, RaftCore, Role, RoleState};
use crate::raft::entry::{AppendResult, ConfigChange, Configuration, LogBoundary, NodeId};
use crate::raft::errors::{RaftError, StorageError};
use crate::raft::event_bus::{EventBus, RaftEvent};
use crate::raft::message::{GenericMessage, Payload};
use crate::raft::snapshot::SnapshotReplication;
use crate::raft::storage::LogStorage;
use crate::raft::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use slog::{debug, error, info, o, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

const MAILBOX_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct RaftNodeConfig {
    pub partition_id: u32,
    pub core: CoreConfig,
    pub tick_interval: Duration,
}

/// Highest committed log index and the highest record position it covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitWatermark {
    pub index: u64,
    pub position: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RaftStatus {
    pub partition_id: u32,
    pub node_id: NodeId,
    pub role: RoleState,
    pub commit: CommitWatermark,
    pub first_index: u64,
    pub last_index: u64,
    pub configuration: Configuration,
    pub fatal: Option<String>,
}

pub enum RaftRequest {
    Tick,
    Peer(GenericMessage),
    Append {
        record_count: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<AppendResult, RaftError>>,
    },
    Campaign,
    TransferLeadership {
        target: NodeId,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    ChangeConfig {
        change: ConfigChange,
        reply: oneshot::Sender<Result<u64, RaftError>>,
    },
    Compact {
        index: u64,
        reply: oneshot::Sender<Result<u64, RaftError>>,
    },
    BoundaryForPosition {
        position: i64,
        reply: oneshot::Sender<Result<Option<LogBoundary>, RaftError>>,
    },
    Status {
        reply: oneshot::Sender<RaftStatus>,
    },
}

pub struct RaftNode {
    partition_id: u32,
    core: RaftCore,
    transport: Arc<dyn Transport>,
    tick_interval: Duration,
    tick_timer: Option<TimerHandle>,
    role_tx: watch::Sender<RoleState>,
    commit_tx: watch::Sender<CommitWatermark>,
    events: EventBus<RaftEvent>,
    health: HealthMonitor,
    failed: bool,
    logger: Logger,
}

impl RaftNode {
    /// Open the core over `storage` and start the node on `scheduler`.
    pub fn spawn(
        scheduler: &ActorScheduler,
        config: RaftNodeConfig,
        storage: Arc<dyn LogStorage>,
        snapshots: Arc<dyn SnapshotReplication>,
        transport: Arc<dyn Transport>,
        health: HealthMonitor,
        logger: Logger,
    ) -> Result<RaftHandle, StorageError> {
        let logger = logger.new(o!("partition" => config.partition_id, "node" => config.core.id));
        let core = RaftCore::new(config.core.clone(), storage.clone(), snapshots, logger.clone())?;

        let (role_tx, role_rx) = watch::channel(core.role_state());
        let (commit_tx, commit_rx) = watch::channel(CommitWatermark {
            index: core.commit_index(),
            position: core.commit_position(),
        });
        let events = EventBus::default();

        let node = RaftNode {
            partition_id: config.partition_id,
            core,
            transport,
            tick_interval: config.tick_interval,
            tick_timer: None,
            role_tx,
            commit_tx,
            events: events.clone(),
            health,
            failed: false,
            logger,
        };
        let actor = scheduler.spawn(node, MAILBOX_CAPACITY);

        Ok(RaftHandle {
            partition_id: config.partition_id,
            node_id: config.core.id,
            actor,
            role_rx,
            commit_rx,
            events,
            storage,
        })
    }

    fn component(&self) -> String {
        format!("raft-{}", self.partition_id)
    }

    fn handle_peer(&mut self, message: GenericMessage) {
        match message.payload {
            Payload::Raft(msg) => self.core.step(message.from, msg),
            Payload::InterPartitionCommand(data) => {
                if self.core.is_leader() {
                    if let Err(e) = self.core.propose(1, data) {
                        debug!(self.logger, "Dropping inter-partition command"; "error" => %e);
                    }
                } else {
                    debug!(self.logger, "Dropping inter-partition command on non-leader";
                        "from" => message.from);
                }
            }
        }
    }

    /// Send queued messages and publish state changes.
    async fn flush(&mut self, ctl: &ActorControl<RaftRequest>) {
        for (to, msg) in self.core.take_messages() {
            let envelope = GenericMessage {
                partition_id: self.partition_id,
                from: self.core.id(),
                to,
                payload: Payload::Raft(msg),
            };
            if let Err(e) = self.transport.send_message(to, envelope).await {
                self.health.record_fault(Fault::Replication);
                debug!(self.logger, "Failed to send message"; "to" => to, "error" => %e);
            }
        }

        let role = self.core.role_state();
        if *self.role_tx.borrow() != role {
            info!(self.logger, "Role changed"; "role" => ?role.role, "term" => role.term, "leader" => ?role.leader);
            self.role_tx.send_replace(role.clone());
            self.events.publish(RaftEvent::RoleChanged(role));
        }

        let watermark = CommitWatermark {
            index: self.core.commit_index(),
            position: self.core.commit_position(),
        };
        self.commit_tx.send_if_modified(|current| {
            if *current != watermark {
                *current = watermark;
                true
            } else {
                false
            }
        });

        if let Some(snapshot) = self.core.take_installed_snapshot() {
            self.events.publish(RaftEvent::SnapshotInstalled(snapshot));
        }

        if let Some(reason) = self.core.fatal_error() {
            if !self.failed {
                self.failed = true;
                let reason = reason.to_string();
                error!(self.logger, "Raft node failed, stopping"; "reason" => &reason);
                self.health.report(&self.component(), HealthStatus::Dead(reason.clone()));
                self.events.publish(RaftEvent::Failed(reason));
                ctl.self_ref().stop();
            }
        }
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            partition_id: self.partition_id,
            node_id: self.core.id(),
            role: self.core.role_state(),
            commit: *self.commit_tx.borrow(),
            first_index: self.core.first_index(),
            last_index: self.core.last_index(),
            configuration: self.core.configuration().clone(),
            fatal: self.core.fatal_error().map(str::to_string),
        }
    }
}

#[async_trait]
impl Actor for RaftNode {
    type Message = RaftRequest;

    fn name(&self) -> String {
        format!("raft-{}-{}", self.partition_id, self.core.id())
    }

    async fn on_start(&mut self, ctl: &ActorControl<RaftRequest>) -> HandlerResult {
        if let Some(timer) = self.tick_timer.take() {
            timer.cancel();
        }
        self.tick_timer = Some(ctl.run_at_fixed_rate(self.tick_interval, || RaftRequest::Tick));
        self.health.report(&self.component(), HealthStatus::Healthy);
        info!(self.logger, "Raft node started";
            "voters" => ?self.core.configuration().voters, "last_index" => self.core.last_index());
        Ok(())
    }

    async fn handle(&mut self, ctl: &ActorControl<RaftRequest>, msg: RaftRequest) -> HandlerResult {
        match msg {
            RaftRequest::Tick => self.core.tick(),
            RaftRequest::Peer(message) => self.handle_peer(message),
            RaftRequest::Append {
                record_count,
                data,
                reply,
            } => {
                let _ = reply.send(self.core.propose(record_count, data));
            }
            RaftRequest::Campaign => self.core.campaign(),
            RaftRequest::TransferLeadership { target, reply } => {
                let _ = reply.send(self.core.transfer_leadership(target));
            }
            RaftRequest::ChangeConfig { change, reply } => {
                let _ = reply.send(self.core.change_config(change));
            }
            RaftRequest::Compact { index, reply } => {
                let _ = reply.send(self.core.compact(index));
            }
            RaftRequest::BoundaryForPosition { position, reply } => {
                let _ = reply.send(self.core.boundary_for_position(position));
            }
            RaftRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
        self.flush(ctl).await;
        Ok(())
    }

    async fn on_stop(&mut self) {
        if let Some(timer) = self.tick_timer.take() {
            timer.cancel();
        }
        if !self.failed {
            self.health.remove(&self.component());
        }
        info!(self.logger, "Raft node stopped");
    }
}

/// Cloneable handle to a partition's Raft node.
#[derive(Clone)]
pub struct RaftHandle {
    partition_id: u32,
    node_id: NodeId,
    actor: ActorRef<RaftRequest>,
    role_rx: watch::Receiver<RoleState>,
    commit_rx: watch::Receiver<CommitWatermark>,
    events: EventBus<RaftEvent>,
    storage: Arc<dyn LogStorage>,
}

fn closed(_: ActorError) -> RaftError {
    RaftError::Closed
}

impl RaftHandle {
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn actor(&self) -> ActorRef<RaftRequest> {
        self.actor.clone()
    }

    pub fn storage(&self) -> Arc<dyn LogStorage> {
        self.storage.clone()
    }

    /// Append a batch of `record_count` encoded records. Leader only.
    pub async fn append(&self, record_count: u64, data: Bytes) -> Result<AppendResult, RaftError> {
        self.actor
            .ask(|reply| RaftRequest::Append {
                record_count,
                data,
                reply,
            })
            .await
            .map_err(closed)?
    }

    pub async fn campaign(&self) -> Result<(), RaftError> {
        self.actor.tell(RaftRequest::Campaign).await.map_err(closed)
    }

    pub async fn transfer_leadership(&self, target: NodeId) -> Result<(), RaftError> {
        self.actor
            .ask(|reply| RaftRequest::TransferLeadership { target, reply })
            .await
            .map_err(closed)?
    }

    pub async fn change_config(&self, change: ConfigChange) -> Result<u64, RaftError> {
        self.actor
            .ask(|reply| RaftRequest::ChangeConfig { change, reply })
            .await
            .map_err(closed)?
    }

    pub async fn compact(&self, index: u64) -> Result<u64, RaftError> {
        self.actor
            .ask(|reply| RaftRequest::Compact { index, reply })
            .await
            .map_err(closed)?
    }

    pub async fn boundary_for_position(&self, position: i64) -> Result<Option<LogBoundary>, RaftError> {
        self.actor
            .ask(|reply| RaftRequest::BoundaryForPosition { position, reply })
            .await
            .map_err(closed)?
    }

    pub async fn status(&self) -> Result<RaftStatus, RaftError> {
        self.actor
            .ask(|reply| RaftRequest::Status { reply })
            .await
            .map_err(closed)
    }

    pub fn role(&self) -> RoleState {
        self.role_rx.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.role_rx.borrow().role == Role::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.role_rx.borrow().leader
    }

    pub fn commit(&self) -> CommitWatermark {
        *self.commit_rx.borrow()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<RoleState> {
        self.role_rx.clone()
    }

    pub fn subscribe_commit(&self) -> watch::Receiver<CommitWatermark> {
        self.commit_rx.clone()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RaftEvent> {
        self.events.subscribe()
    }

    /// Wait until the commit position reaches `position`.
    pub async fn wait_for_commit_position(&self, position: i64) -> Result<(), RaftError> {
        let mut rx = self.commit_rx.clone();
        rx.wait_for(|w| w.position >= position)
            .await
            .map(|_| ())
            .map_err(|_| RaftError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.actor.is_closed()
    }

    pub async fn shutdown(&self) {
        self.actor.stop_and_wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_logger;
    use crate::raft::cluster_router::ClusterRouter;
    use crate::raft::core::tests::MemSnapshots;
    use crate::raft::server::{InProcessMessageSender, InProcessServer};
    use crate::raft::storage::MemLogStorage;
    use crate::raft::transport::TransportLayer;

    struct TestCluster {
        server: Arc<InProcessServer>,
        handles: Vec<RaftHandle>,
        _scheduler: ActorScheduler,
    }

    async fn start_cluster(ids: &[NodeId]) -> TestCluster {
        let logger = test_logger();
        let scheduler = ActorScheduler::current(logger.clone());
        let server = Arc::new(InProcessServer::new());
        let configuration = Configuration::new(ids.iter().copied());
        let mut handles = Vec::new();

        for id in ids {
            let transport = Arc::new(TransportLayer::new(Arc::new(InProcessMessageSender::new(server.clone()))));
            for peer in ids {
                transport.add_peer(*peer, InProcessMessageSender::address(*peer)).await;
            }
            let router = ClusterRouter::new();
            let callback_router = router.clone();
            server.register_node(*id, move |msg| {
                let _ = callback_router.route_message(msg);
                Ok(())
            });

            let config = RaftNodeConfig {
                partition_id: 1,
                core: CoreConfig {
                    id: *id,
                    election_tick: 10,
                    heartbeat_tick: 2,
                    max_append_entries: 64,
                    check_quorum: true,
                },
                tick_interval: Duration::from_millis(10),
            };
            let handle = RaftNode::spawn(
                &scheduler,
                config,
                Arc::new(MemLogStorage::new(configuration.clone())),
                Arc::new(MemSnapshots::default()),
                transport,
                HealthMonitor::new(logger.clone()),
                logger.clone(),
            )
            .unwrap();
            router.register_partition(1, handle.actor());
            handles.push(handle);
        }

        TestCluster {
            server,
            handles,
            _scheduler: scheduler,
        }
    }

    async fn wait_for_leader(handles: &[RaftHandle]) -> RaftHandle {
        for _ in 0..500 {
            if let Some(h) = handles.iter().find(|h| h.is_leader()) {
                return h.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_three_nodes_elect_and_commit() {
        let cluster = start_cluster(&[1, 2, 3]).await;
        let leader = wait_for_leader(&cluster.handles).await;

        let result = leader.append(2, Bytes::from_static(b"batch")).await.unwrap();
        assert_eq!((result.lowest_position, result.highest_position), (1, 2));

        for handle in &cluster.handles {
            tokio::time::timeout(Duration::from_secs(5), handle.wait_for_commit_position(2))
                .await
                .unwrap()
                .unwrap();
        }

        let follower = cluster.handles.iter().find(|h| !h.is_leader()).unwrap();
        let err = follower.append(1, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failover_after_leader_isolation() {
        let cluster = start_cluster(&[1, 2, 3]).await;
        let old = wait_for_leader(&cluster.handles).await;
        let mut events = cluster
            .handles
            .iter()
            .find(|h| h.node_id() != old.node_id())
            .unwrap()
            .subscribe_events();

        cluster.server.isolate(old.node_id());
        let others: Vec<RaftHandle> = cluster
            .handles
            .iter()
            .filter(|h| h.node_id() != old.node_id())
            .cloned()
            .collect();
        let new = wait_for_leader(&others).await;
        assert_ne!(new.node_id(), old.node_id());
        assert!(new.role().term > old.role().term || !old.is_leader());

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, RaftEvent::RoleChanged(_)));
        cluster.server.heal();
    }
}
