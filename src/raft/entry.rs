//! Log entries and persistent Raft state

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type NodeId = u64;

/// State that must be durable before a node answers any message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: Option<NodeId>,
    pub commit: u64,
}

/// Voting members of a partition's Raft group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub voters: BTreeSet<NodeId>,
}

impl Configuration {
    pub fn new<I: IntoIterator<Item = NodeId>>(voters: I) -> Self {
        Self {
            voters: voters.into_iter().collect(),
        }
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.voters.contains(&node_id)
    }

    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }
}

/// Single-server membership change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    AddVoter(NodeId),
    RemoveVoter(NodeId),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries of earlier terms.
    Noop,
    /// A batch of records occupying positions `lowest_position..=highest_position`.
    Application {
        lowest_position: i64,
        highest_position: i64,
        data: Bytes,
    },
    Config(Configuration),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Highest record position carried by this entry, if it is an application entry.
    pub fn highest_position(&self) -> Option<i64> {
        match &self.payload {
            EntryPayload::Application {
                highest_position, ..
            } => Some(*highest_position),
            _ => None,
        }
    }

    pub fn lowest_position(&self) -> Option<i64> {
        match &self.payload {
            EntryPayload::Application {
                lowest_position, ..
            } => Some(*lowest_position),
            _ => None,
        }
    }
}

/// The compacted prefix of the log: everything up to and including `index`
/// is covered by a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBoundary {
    pub index: u64,
    pub term: u64,
    /// Highest record position at or below `index`.
    pub position: i64,
}

/// Outcome of a successful local append on the leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendResult {
    pub index: u64,
    pub lowest_position: i64,
    pub highest_position: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum() {
        assert_eq!(Configuration::new([1]).quorum(), 1);
        assert_eq!(Configuration::new([1, 2]).quorum(), 2);
        assert_eq!(Configuration::new([1, 2, 3]).quorum(), 2);
        assert_eq!(Configuration::new([1, 2, 3, 4, 5]).quorum(), 3);
    }

    #[test]
    fn test_entry_positions() {
        let entry = LogEntry {
            index: 3,
            term: 1,
            payload: EntryPayload::Application {
                lowest_position: 10,
                highest_position: 12,
                data: Bytes::from_static(b"[]"),
            },
        };
        assert_eq!(entry.lowest_position(), Some(10));
        assert_eq!(entry.highest_position(), Some(12));

        let noop = LogEntry {
            index: 4,
            term: 1,
            payload: EntryPayload::Noop,
        };
        assert_eq!(noop.highest_position(), None);
    }
}
