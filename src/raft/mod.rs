//! Replicated log
//!
//! One Raft group per partition. Layers, bottom up:
//! - `server`: protocol implementations (HTTP, in-process)
//! - `transport`: protocol-agnostic peer registry and sending
//! - `cluster_router`: routes incoming messages by partition id
//! - `node`: the Raft node actor around the synchronous `core`
//! - `storage`: durable log storage (RocksDB, in-memory)
//! - `event_bus`: role changes and installed snapshots for upper layers

pub mod cluster_router;
pub mod core;
pub mod entry;
pub mod errors;
pub mod event_bus;
pub mod message;
pub mod node;
pub mod server;
pub mod snapshot;
pub mod storage;
pub mod transport;

pub use self::cluster_router::ClusterRouter;
pub use self::core::{CoreConfig, RaftCore, Role, RoleState};
pub use self::entry::{AppendResult, ConfigChange, Configuration, EntryPayload, LogBoundary, LogEntry, NodeId};
pub use self::errors::{RaftError, RoutingError, StorageError, TransportError};
pub use self::event_bus::{EventBus, RaftEvent};
pub use self::message::{GenericMessage, Payload, RaftMessage};
pub use self::node::{CommitWatermark, RaftHandle, RaftNode, RaftNodeConfig, RaftRequest, RaftStatus};
pub use self::server::{HttpMessageSender, HttpServer, InProcessMessageSender, InProcessServer};
pub use self::snapshot::{SnapshotChunk, SnapshotDescriptor, SnapshotReplication};
pub use self::storage::{LogStorage, MemLogStorage, RocksLogStorage};
pub use self::transport::{MessageSender, Transport, TransportLayer};
