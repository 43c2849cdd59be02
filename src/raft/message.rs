//! Wire messages exchanged between brokers
//!
//! Every message travels inside a [`GenericMessage`] envelope carrying the
//! partition it belongs to, so one transport serves all partitions of a node.

use crate::raft::entry::{LogEntry, NodeId};
use crate::raft::snapshot::{SnapshotChunk, SnapshotDescriptor};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenericMessage {
    pub partition_id: u32,
    pub from: NodeId,
    pub to: NodeId,
    pub payload: Payload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    Raft(RaftMessage),
    /// A command for the target partition's log, appended by its leader.
    /// The bytes are an encoded record batch; non-leaders drop it.
    InterPartitionCommand(Bytes),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
        /// Set when campaigning on behalf of a leadership transfer, which
        /// bypasses leader stickiness on the voters.
        transfer: bool,
    },
    VoteResponse {
        term: u64,
        granted: bool,
    },
    AppendEntries {
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendResponse {
        term: u64,
        success: bool,
        /// Last index known to match the leader's log on success.
        match_index: u64,
        /// Next index the leader should try after a rejection.
        reject_hint: u64,
    },
    InstallSnapshot {
        term: u64,
        snapshot: SnapshotDescriptor,
        chunk: SnapshotChunk,
    },
    InstallSnapshotResponse {
        term: u64,
        snapshot_id: String,
        success: bool,
        next_chunk: u32,
        done: bool,
    },
    TimeoutNow {
        term: u64,
    },
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term, .. }
            | RaftMessage::TimeoutNow { term } => *term,
        }
    }

    /// Messages only a leader sends; receiving one at the current term
    /// identifies the sender as leader.
    pub fn is_from_leader(&self) -> bool {
        matches!(
            self,
            RaftMessage::AppendEntries { .. }
                | RaftMessage::InstallSnapshot { .. }
                | RaftMessage::TimeoutNow { .. }
        )
    }
}
