//! raftstream: a partitioned, Raft-replicated, event-sourced processing engine.
//!
//! Layering, leaf first:
//! - `actor`: cooperative actor scheduler every long-lived component runs on
//! - `raft`: per-partition consensus, log storage and peer transport
//! - `logstream`: position-based view over the replicated log
//! - `state`: the RocksDB-backed processing state and its migrations
//! - `engine`: command processors and event appliers
//! - `stream`: the stream processor driving replay and processing
//! - `snapshot`, `exporter`, `backup`: the snapshot and egress lifecycle
//! - `partition`, `broker`: wiring, role transitions and the public API

pub mod actor;
pub mod backup;
pub mod broker;
pub mod config;
pub mod engine;
pub mod exporter;
pub mod health;
pub mod logging;
pub mod logstream;
pub mod partition;
pub mod protocol;
pub mod raft;
pub mod snapshot;
pub mod state;
pub mod stream;

pub use broker::{Broker, BrokerError, CommandRequest, CommandResponse, IngressError};
pub use config::{BrokerConfig, ConfigError};
pub use protocol::{Intent, Record, RecordType, RecordValue, RejectionType, ValueType};
