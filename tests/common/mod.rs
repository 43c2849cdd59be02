//! In-process brokers for integration tests.

#![allow(dead_code)]

use raftstream::actor::ActorScheduler;
use raftstream::config::MemberConfig;
use raftstream::engine::ControlledClock;
use raftstream::logging::test_logger;
use raftstream::raft::{InProcessMessageSender, InProcessServer, NodeId};
use raftstream::state::{Keyspace, StateDb};
use raftstream::stream::StreamProcessorMode;
use raftstream::{Broker, BrokerConfig, CommandRequest, CommandResponse, IngressError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(20);

pub struct TestCluster {
    pub server: Arc<InProcessServer>,
    pub brokers: Vec<Option<Broker>>,
    pub configs: Vec<BrokerConfig>,
    pub clock: ControlledClock,
    pub scheduler: ActorScheduler,
    pub dir: TempDir,
}

pub fn broker_config(root: &Path, node_id: NodeId, nodes: u64, partitions: u32, replication_factor: usize) -> BrokerConfig {
    let members = (1..=nodes)
        .map(|id| MemberConfig {
            node_id: id,
            address: InProcessMessageSender::address(id),
        })
        .collect();
    let mut config = BrokerConfig::single_node(root.join(format!("node-{}", node_id)))
        .with_node_id(node_id)
        .with_members(members)
        .with_partitions(partitions, replication_factor)
        .with_backup_dir(root.join("backups"))
        .with_snapshot_period(Duration::from_secs(3600));
    config.raft.tick_interval_ms = 10;
    config.raft.election_tick = 10;
    config.raft.heartbeat_tick = 2;
    config.raft.snapshot_chunk_size = 4 * 1024;
    config.processing.request_timeout_ms = 5_000;
    config.processing.retry_delay_ms = 50;
    config.processing.redistribution_interval_ms = 100;
    config.exporters.flush_interval_ms = 100;
    config
}

impl TestCluster {
    pub async fn start(nodes: u64, partitions: u32, replication_factor: usize) -> Self {
        Self::start_with(nodes, partitions, replication_factor, |_| {}).await
    }

    pub async fn start_with<F>(nodes: u64, partitions: u32, replication_factor: usize, adjust: F) -> Self
    where
        F: Fn(&mut BrokerConfig),
    {
        let dir = tempfile::tempdir().unwrap();
        let configs: Vec<BrokerConfig> = (1..=nodes)
            .map(|id| {
                let mut config = broker_config(dir.path(), id, nodes, partitions, replication_factor);
                adjust(&mut config);
                config
            })
            .collect();
        let mut cluster = TestCluster {
            server: Arc::new(InProcessServer::new()),
            brokers: Vec::new(),
            configs,
            clock: ControlledClock::new(1_000),
            scheduler: ActorScheduler::current(test_logger()),
            dir,
        };
        for node_id in 1..=nodes {
            let broker = cluster.start_broker(node_id).await;
            cluster.brokers.push(Some(broker));
        }
        cluster
    }

    async fn start_broker(&self, node_id: NodeId) -> Broker {
        let config = self.configs[(node_id - 1) as usize].clone();
        let broker = Broker::start(
            config,
            &self.scheduler,
            Arc::new(InProcessMessageSender::new(self.server.clone())),
            Arc::new(self.clock.clone()),
            test_logger(),
        )
        .await
        .unwrap();
        let router = broker.router();
        self.server.register_node(node_id, move |msg| {
            let _ = router.route_message(msg);
            Ok(())
        });
        broker
    }

    pub fn broker(&self, node_id: NodeId) -> &Broker {
        self.brokers[(node_id - 1) as usize].as_ref().unwrap()
    }

    /// Stop a broker and start it again on the same data directory.
    pub async fn restart(&mut self, node_id: NodeId) {
        self.stop(node_id).await;
        let broker = self.start_broker(node_id).await;
        self.brokers[(node_id - 1) as usize] = Some(broker);
    }

    pub async fn stop(&mut self, node_id: NodeId) {
        self.server.unregister_node(node_id);
        if let Some(broker) = self.brokers[(node_id - 1) as usize].take() {
            broker.shutdown().await;
        }
        // let the stopped actors release their stores
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    pub fn running(&self) -> impl Iterator<Item = &Broker> {
        self.brokers.iter().flatten()
    }

    /// Wait for a leader of `partition_id` whose processor accepts commands.
    pub async fn leader(&self, partition_id: u32) -> &Broker {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            for broker in self.running() {
                let Some(partition) = broker.partition(partition_id) else {
                    continue;
                };
                if partition.raft().is_leader()
                    && partition
                        .processor()
                        .is_some_and(|p| p.mode() == StreamProcessorMode::Processing)
                {
                    return broker;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader for partition {}", partition_id);
    }

    /// Submit to the current leader, following leader changes.
    pub async fn submit(&self, partition_id: u32, request: CommandRequest) -> CommandResponse {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let leader = self.leader(partition_id).await;
            match leader.submit_command(partition_id, request.clone()).await {
                Ok(response) => return response,
                Err(IngressError::NotLeader { .. }) | Err(IngressError::Timeout(_)) | Err(IngressError::Closed)
                    if tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("command failed: {}", e),
            }
        }
    }

    /// Wait until every running replica of `partition_id` processed up to `position`.
    pub async fn await_processed(&self, partition_id: u32, position: i64) {
        let deadline = tokio::time::Instant::now() + WAIT;
        'outer: while tokio::time::Instant::now() < deadline {
            for broker in self.running() {
                let Some(partition) = broker.partition(partition_id) else {
                    continue;
                };
                let processed = match partition.processor() {
                    Some(processor) => processor.positions().await.map(|p| p.last_processed).unwrap_or(-1),
                    None => -1,
                };
                if processed < position {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    continue 'outer;
                }
            }
            return;
        }
        panic!("replicas of partition {} did not reach position {}", partition_id, position);
    }

    pub fn state(&self, node_id: NodeId, partition_id: u32) -> StateDb {
        self.broker(node_id)
            .partition(partition_id)
            .and_then(|p| p.processor())
            .map(|p| p.state().clone())
            .unwrap()
    }

    pub async fn shutdown(mut self) {
        for node_id in 1..=self.brokers.len() as u64 {
            self.stop(node_id).await;
        }
    }
}

/// State content without the last processed position, which followers
/// derive from event sources and leaders from command positions.
pub fn state_dump(state: &StateDb) -> Vec<(&'static str, Vec<(Vec<u8>, Vec<u8>)>)> {
    state
        .dump()
        .unwrap()
        .into_iter()
        .filter(|(name, _)| *name != Keyspace::LastProcessed.name())
        .collect()
}
