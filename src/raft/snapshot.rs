//! Snapshot replication seam between the Raft core and the snapshot store
//!
//! The core never touches snapshot files itself: the leader reads chunks of
//! the latest persisted snapshot through [`SnapshotReplication`] and the
//! follower writes received chunks back through the same trait.

use crate::raft::entry::{Configuration, LogBoundary};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity and log coordinates of a persisted snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub id: String,
    pub boundary: LogBoundary,
    pub configuration: Configuration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    /// Sequence number of this chunk, starting at 0.
    pub index: u32,
    pub total: u32,
    pub file_name: String,
    pub offset: u64,
    pub data: Bytes,
    pub checksum: u32,
}

impl SnapshotChunk {
    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.total
    }

    pub fn verify(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }
}

pub trait SnapshotReplication: Send + Sync {
    /// Latest persisted snapshot, if any.
    fn latest(&self) -> Option<SnapshotDescriptor>;

    fn read_chunk(&self, snapshot_id: &str, chunk_index: u32) -> Result<SnapshotChunk, String>;

    /// Start receiving `snapshot`, discarding any partially received one.
    fn begin_receive(&self, snapshot: &SnapshotDescriptor) -> Result<(), String>;

    fn write_chunk(&self, snapshot: &SnapshotDescriptor, chunk: &SnapshotChunk) -> Result<(), String>;

    /// Verify and persist the received snapshot.
    fn complete_receive(&self, snapshot: &SnapshotDescriptor) -> Result<(), String>;

    fn abort_receive(&self, snapshot_id: &str);
}
