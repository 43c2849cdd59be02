//! Protocol-agnostic transport layer
//!
//! Sends and receives [`GenericMessage`]s without tying the Raft layer to a
//! specific protocol. The protocol (HTTP or in-process) is determined by the
//! [`MessageSender`] implementation injected by the server layer.

use crate::raft::errors::TransportError;
use crate::raft::message::GenericMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Protocol-specific message sender.
///
/// Implemented by each server layer (HTTP, InProcess) to provide actual
/// message delivery.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send a message to a peer at the given protocol-specific address
    /// (e.g. "http://10.0.0.5:7000" or "node:2").
    async fn send(&self, address: &str, message: GenericMessage) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a peer node.
    async fn send_message(&self, target_node_id: u64, message: GenericMessage) -> Result<(), TransportError>;

    async fn add_peer(&self, node_id: u64, address: String);

    async fn remove_peer(&self, node_id: u64);
}

/// Peer registry plus an injected [`MessageSender`].
pub struct TransportLayer {
    /// node_id → address (protocol-agnostic string)
    peers: Arc<Mutex<HashMap<u64, String>>>,

    message_sender: Arc<dyn MessageSender>,
}

impl TransportLayer {
    pub fn new(message_sender: Arc<dyn MessageSender>) -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            message_sender,
        }
    }
}

#[async_trait]
impl Transport for TransportLayer {
    async fn send_message(&self, target_node_id: u64, message: GenericMessage) -> Result<(), TransportError> {
        let address = {
            let peers = self.peers.lock().await;
            peers.get(&target_node_id).cloned()
        };

        match address {
            Some(addr) => self.message_sender.send(&addr, message).await,
            None => Err(TransportError::PeerNotFound {
                node_id: target_node_id,
            }),
        }
    }

    async fn add_peer(&self, node_id: u64, address: String) {
        let mut peers = self.peers.lock().await;
        peers.insert(node_id, address);
    }

    async fn remove_peer(&self, node_id: u64) {
        let mut peers = self.peers.lock().await;
        peers.remove(&node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::{Payload, RaftMessage};

    struct MockMessageSender {
        sent_messages: Arc<Mutex<Vec<(String, GenericMessage)>>>,
    }

    impl MockMessageSender {
        fn new() -> Self {
            Self {
                sent_messages: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn get_sent_messages(&self) -> Vec<(String, GenericMessage)> {
            self.sent_messages.lock().await.clone()
        }
    }

    #[async_trait]
    impl MessageSender for MockMessageSender {
        async fn send(&self, address: &str, message: GenericMessage) -> Result<(), TransportError> {
            self.sent_messages
                .lock()
                .await
                .push((address.to_string(), message));
            Ok(())
        }
    }

    fn heartbeat(partition_id: u32, to: u64) -> GenericMessage {
        GenericMessage {
            partition_id,
            from: 1,
            to,
            payload: Payload::Raft(RaftMessage::TimeoutNow { term: 1 }),
        }
    }

    #[tokio::test]
    async fn test_transport_add_and_remove_peer() {
        let transport = TransportLayer::new(Arc::new(MockMessageSender::new()));

        transport.add_peer(1, "node:1".to_string()).await;
        transport.add_peer(2, "node:2".to_string()).await;
        transport.remove_peer(1).await;

        assert!(transport.send_message(2, heartbeat(1, 2)).await.is_ok());
        assert!(matches!(
            transport.send_message(1, heartbeat(1, 1)).await,
            Err(TransportError::PeerNotFound { node_id: 1 })
        ));
    }

    #[tokio::test]
    async fn test_transport_send_message() {
        let sender = Arc::new(MockMessageSender::new());
        let transport = TransportLayer::new(sender.clone());
        transport.add_peer(2, "http://10.0.0.2:7000".to_string()).await;

        transport.send_message(2, heartbeat(3, 2)).await.unwrap();

        let sent = sender.get_sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "http://10.0.0.2:7000");
        assert_eq!(sent[0].1.partition_id, 3);
    }

    #[tokio::test]
    async fn test_transport_send_to_unknown_peer() {
        let transport = TransportLayer::new(Arc::new(MockMessageSender::new()));

        match transport.send_message(99, heartbeat(1, 99)).await {
            Err(TransportError::PeerNotFound { node_id }) => assert_eq!(node_id, 99),
            other => panic!("Expected PeerNotFound error, got {:?}", other),
        }
    }
}
