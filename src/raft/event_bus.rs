//! Event Bus
//!
//! Decouples the Raft node from the components reacting to its state changes
//! (partition controller, broker). The node publishes, any number of
//! subscribers receive.

use crate::raft::core::RoleState;
use crate::raft::snapshot::SnapshotDescriptor;
use tokio::sync::broadcast;

/// State changes published by a partition's Raft node.
#[derive(Clone, Debug, PartialEq)]
pub enum RaftEvent {
    RoleChanged(RoleState),
    /// A snapshot received from the leader replaced the local log prefix.
    SnapshotInstalled(SnapshotDescriptor),
    /// The replica stopped after a fatal error.
    Failed(String),
}

/// Broadcasts events to all current subscribers.
///
/// A subscriber that falls more than `capacity` events behind loses the
/// oldest ones and observes `RecvError::Lagged`.
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; returns the number of subscribers that received it.
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Receive all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::core::Role;

    fn leader(term: u64) -> RaftEvent {
        RaftEvent::RoleChanged(RoleState {
            role: Role::Leader,
            term,
            leader: Some(1),
        })
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(leader(1)), 2);
        assert_eq!(rx1.recv().await.unwrap(), leader(1));
        assert_eq!(rx2.recv().await.unwrap(), leader(1));
    }

    #[tokio::test]
    async fn test_event_bus_late_subscriber() {
        let bus = EventBus::new(10);
        assert_eq!(bus.publish(leader(1)), 0);

        let mut rx = bus.subscribe();
        bus.publish(RaftEvent::Failed("disk".into()));
        assert_eq!(rx.recv().await.unwrap(), RaftEvent::Failed("disk".into()));
    }

    #[tokio::test]
    async fn test_event_bus_subscriber_drop() {
        let bus: EventBus<RaftEvent> = EventBus::new(10);
        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(rx1);
        assert_eq!(bus.publish(leader(2)), 1);
    }
}
