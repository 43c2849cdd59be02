//! Error types for the replicated log

use std::fmt;
use thiserror::Error;

/// Errors that can occur during transport operations
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Peer node not found in registry
    PeerNotFound { node_id: u64 },

    /// Link to the peer is down (isolated in tests, unreachable over HTTP)
    Unreachable { node_id: u64 },

    /// Message could not be encoded, or the peer address is malformed
    SerializationError { reason: String },

    /// Other transport error
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::PeerNotFound { node_id } => {
                write!(f, "Peer node {} not found in registry", node_id)
            }
            TransportError::Unreachable { node_id } => {
                write!(f, "Node {} is unreachable", node_id)
            }
            TransportError::SerializationError { reason } => {
                write!(f, "Failed to serialize message: {}", reason)
            }
            TransportError::Other(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors that can occur during message routing
#[derive(Debug, Clone)]
pub enum RoutingError {
    /// Partition not hosted on this node
    PartitionNotFound { partition_id: u32 },

    /// Mailbox full (backpressure)
    MailboxFull { partition_id: u32 },

    /// The partition's Raft node is shutting down
    Closed { partition_id: u32 },
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::PartitionNotFound { partition_id } => {
                write!(f, "Partition {} not found in router", partition_id)
            }
            RoutingError::MailboxFull { partition_id } => {
                write!(f, "Mailbox full for partition {}", partition_id)
            }
            RoutingError::Closed { partition_id } => {
                write!(f, "Raft node of partition {} is closed", partition_id)
            }
        }
    }
}

impl std::error::Error for RoutingError {}

/// Errors from durable log storage. Any of these is fatal to the replica.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("log storage I/O failed: {0}")]
    Io(String),

    #[error("corrupted log storage: {0}")]
    Corrupted(String),

    #[error("entry {index} was compacted")]
    Compacted { index: u64 },

    #[error("entry {index} is not available (last index {last_index})")]
    Unavailable { index: u64, last_index: u64 },

    #[error("non-contiguous append: expected index {expected}, got {actual}")]
    NonContiguous { expected: u64, actual: u64 },
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Corrupted(e.to_string())
    }
}

/// Errors returned to callers of the replicated log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RaftError {
    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    #[error("leadership transfer to {target} in progress")]
    TransferInProgress { target: u64 },

    #[error("node {node_id} is not a voter")]
    NotAVoter { node_id: u64 },

    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,

    #[error("invalid configuration change: {0}")]
    InvalidConfigChange(String),

    #[error("replica stopped after a fatal error: {0}")]
    Fatal(String),

    #[error("raft node is closed")]
    Closed,
}
