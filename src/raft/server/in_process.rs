//! In-process server for testing
//!
//! Routes messages between brokers of one process without network I/O, and
//! can cut links to simulate network partitions.

use crate::raft::errors::TransportError;
use crate::raft::message::GenericMessage;
use crate::raft::transport::MessageSender;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

type NodeCallback = Arc<dyn Fn(GenericMessage) -> Result<(), TransportError> + Send + Sync>;

/// In-process server that routes messages between nodes in memory.
///
/// Messages sent to a node are handed directly to that node's receive
/// callback. Messages from or to an isolated node are dropped.
#[derive(Default)]
pub struct InProcessServer {
    nodes: RwLock<HashMap<u64, NodeCallback>>,
    isolated: RwLock<HashSet<u64>>,
}

impl InProcessServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node<F>(&self, node_id: u64, callback: F)
    where
        F: Fn(GenericMessage) -> Result<(), TransportError> + Send + Sync + 'static,
    {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id, Arc::new(callback));
    }

    pub fn unregister_node(&self, node_id: u64) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node_id);
    }

    /// Cut every link of `node_id`.
    pub fn isolate(&self, node_id: u64) {
        self.isolated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id);
    }

    /// Restore all links.
    pub fn heal(&self) {
        self.isolated.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn send_to_node(&self, target_node_id: u64, message: GenericMessage) -> Result<(), TransportError> {
        {
            let isolated = self.isolated.read().unwrap_or_else(PoisonError::into_inner);
            if isolated.contains(&message.from) || isolated.contains(&target_node_id) {
                return Err(TransportError::Unreachable {
                    node_id: target_node_id,
                });
            }
        }
        let callback = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target_node_id)
            .cloned();
        match callback {
            Some(callback) => callback(message),
            None => Err(TransportError::PeerNotFound {
                node_id: target_node_id,
            }),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// [`MessageSender`] for addresses of the form `node:<id>`.
pub struct InProcessMessageSender {
    server: Arc<InProcessServer>,
}

impl InProcessMessageSender {
    pub fn new(server: Arc<InProcessServer>) -> Self {
        Self { server }
    }

    pub fn address(node_id: u64) -> String {
        format!("node:{}", node_id)
    }

    fn parse_node_id(address: &str) -> Result<u64, TransportError> {
        address
            .strip_prefix("node:")
            .ok_or_else(|| TransportError::SerializationError {
                reason: format!(
                    "Invalid in-process address '{}', expected format 'node:<id>'",
                    address
                ),
            })?
            .parse::<u64>()
            .map_err(|e| TransportError::SerializationError {
                reason: format!("Invalid node address '{}': {}", address, e),
            })
    }
}

#[async_trait]
impl MessageSender for InProcessMessageSender {
    async fn send(&self, address: &str, message: GenericMessage) -> Result<(), TransportError> {
        let node_id = Self::parse_node_id(address)?;
        self.server.send_to_node(node_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::{Payload, RaftMessage};
    use std::sync::Mutex;

    fn message(from: u64, to: u64) -> GenericMessage {
        GenericMessage {
            partition_id: 1,
            from,
            to,
            payload: Payload::Raft(RaftMessage::TimeoutNow { term: 1 }),
        }
    }

    fn recording_server() -> (Arc<InProcessServer>, Arc<Mutex<Vec<u64>>>) {
        let server = Arc::new(InProcessServer::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        for id in [1, 2] {
            let sink = received.clone();
            server.register_node(id, move |msg| {
                sink.lock().unwrap().push(msg.to);
                Ok(())
            });
        }
        (server, received)
    }

    #[test]
    fn test_register_and_unregister() {
        let (server, _) = recording_server();
        assert_eq!(server.node_count(), 2);
        server.unregister_node(1);
        assert_eq!(server.node_count(), 1);
    }

    #[tokio::test]
    async fn test_send_through_message_sender() {
        let (server, received) = recording_server();
        let sender = InProcessMessageSender::new(server.clone());

        sender.send("node:2", message(1, 2)).await.unwrap();
        assert_eq!(*received.lock().unwrap(), vec![2]);

        match sender.send("node:99", message(1, 99)).await {
            Err(TransportError::PeerNotFound { node_id }) => assert_eq!(node_id, 99),
            other => panic!("Expected PeerNotFound error, got {:?}", other),
        }
    }

    #[test]
    fn test_isolation_drops_both_directions() {
        let (server, received) = recording_server();
        server.isolate(1);
        assert!(server.send_to_node(2, message(1, 2)).is_err());
        assert!(server.send_to_node(1, message(2, 1)).is_err());
        assert!(received.lock().unwrap().is_empty());

        server.heal();
        server.send_to_node(1, message(2, 1)).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(InProcessMessageSender::parse_node_id("node:42").unwrap(), 42);
        assert_eq!(InProcessMessageSender::address(3), "node:3");
        assert!(InProcessMessageSender::parse_node_id("invalid").is_err());
        assert!(InProcessMessageSender::parse_node_id("node:abc").is_err());
    }
}
