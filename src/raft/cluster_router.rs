//! Cluster Router
//!
//! Routes incoming peer messages to the Raft node of the partition named in
//! the message envelope.

use crate::actor::{ActorError, ActorRef};
use crate::raft::errors::RoutingError;
use crate::raft::message::GenericMessage;
use crate::raft::node::RaftRequest;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Maps partition ids to the mailbox of the local Raft node for that partition.
///
/// Routing never waits: a full mailbox drops the message (Raft retransmits)
/// and reports [`RoutingError::MailboxFull`].
#[derive(Clone, Default)]
pub struct ClusterRouter {
    routes: Arc<RwLock<HashMap<u32, ActorRef<RaftRequest>>>>,
}

impl ClusterRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_partition(&self, partition_id: u32, node: ActorRef<RaftRequest>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition_id, node);
    }

    pub fn unregister_partition(&self, partition_id: u32) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&partition_id);
    }

    pub fn route_message(&self, message: GenericMessage) -> Result<(), RoutingError> {
        let partition_id = message.partition_id;
        let node = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition_id)
            .cloned();

        match node {
            Some(node) => node
                .try_tell(RaftRequest::Peer(message))
                .map_err(|e| match e {
                    ActorError::MailboxFull { .. } => RoutingError::MailboxFull { partition_id },
                    _ => RoutingError::Closed { partition_id },
                }),
            None => Err(RoutingError::PartitionNotFound { partition_id }),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_partition_registered(&self, partition_id: u32) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&partition_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, ActorControl, ActorScheduler, HandlerResult};
    use crate::logging::test_logger;
    use crate::raft::message::{Payload, RaftMessage};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Forwards every peer message's partition id to a channel.
    struct Probe {
        seen: mpsc::UnboundedSender<u32>,
    }

    #[async_trait]
    impl Actor for Probe {
        type Message = RaftRequest;

        fn name(&self) -> String {
            "probe".to_string()
        }

        async fn handle(&mut self, _ctl: &ActorControl<RaftRequest>, msg: RaftRequest) -> HandlerResult {
            if let RaftRequest::Peer(message) = msg {
                let _ = self.seen.send(message.partition_id);
            }
            Ok(())
        }
    }

    fn message(partition_id: u32) -> GenericMessage {
        GenericMessage {
            partition_id,
            from: 2,
            to: 1,
            payload: Payload::Raft(RaftMessage::TimeoutNow { term: 1 }),
        }
    }

    #[tokio::test]
    async fn test_route_to_registered_partition() {
        let scheduler = ActorScheduler::current(test_logger());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let node = scheduler.spawn(Probe { seen: tx }, 8);

        let router = ClusterRouter::new();
        router.register_partition(3, node);
        assert!(router.is_partition_registered(3));
        assert_eq!(router.partition_count(), 1);

        router.route_message(message(3)).unwrap();
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_route_to_unknown_partition() {
        let router = ClusterRouter::new();
        match router.route_message(message(9)) {
            Err(RoutingError::PartitionNotFound { partition_id }) => assert_eq!(partition_id, 9),
            other => panic!("Expected PartitionNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregister_and_closed_node() {
        let scheduler = ActorScheduler::current(test_logger());
        let (tx, _rx) = mpsc::unbounded_channel();
        let node = scheduler.spawn(Probe { seen: tx }, 8);
        let router = ClusterRouter::new();
        router.register_partition(1, node.clone());

        node.stop_and_wait().await;
        assert!(matches!(
            router.route_message(message(1)),
            Err(RoutingError::Closed { partition_id: 1 })
        ));

        router.unregister_partition(1);
        assert!(!router.is_partition_registered(1));
    }
}
