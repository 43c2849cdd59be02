use super::{encode_batch, LogStreamError};
use crate::protocol::Record;
use crate::raft::entry::AppendResult;
use crate::raft::node::RaftHandle;
use async_trait::async_trait;

/// Appends record batches to a partition's log.
#[async_trait]
pub trait LogAppender: Send + Sync {
    /// Append `records` as one batch. Returns once the batch is durable on
    /// the local replica; commitment follows asynchronously.
    async fn append(&self, records: Vec<Record>) -> Result<AppendResult, LogStreamError>;
}

/// [`LogAppender`] writing through the partition's Raft leader.
#[derive(Clone)]
pub struct LogStreamWriter {
    raft: RaftHandle,
}

impl LogStreamWriter {
    pub fn new(raft: RaftHandle) -> Self {
        Self { raft }
    }
}

#[async_trait]
impl LogAppender for LogStreamWriter {
    async fn append(&self, records: Vec<Record>) -> Result<AppendResult, LogStreamError> {
        let data = encode_batch(&records)?;
        Ok(self.raft.append(records.len() as u64, data).await?)
    }
}
