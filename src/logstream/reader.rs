use super::{decode_entry, LogStreamError};
use crate::protocol::Record;
use crate::raft::errors::StorageError;
use crate::raft::node::CommitWatermark;
use crate::raft::storage::LogStorage;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Reads committed records in position order.
///
/// The reader never looks past the commit index, so everything it returns is
/// durable on a quorum and will never be truncated.
pub struct LogStreamReader {
    storage: Arc<dyn LogStorage>,
    commit: watch::Receiver<CommitWatermark>,
    next_index: u64,
    /// Records at or below this position are skipped.
    min_position: i64,
    buffer: VecDeque<Record>,
}

impl LogStreamReader {
    pub fn new(storage: Arc<dyn LogStorage>, commit: watch::Receiver<CommitWatermark>) -> Self {
        let next_index = storage.first_index();
        Self {
            storage,
            commit,
            next_index,
            min_position: 0,
            buffer: VecDeque::new(),
        }
    }

    pub fn commit_position(&self) -> i64 {
        self.commit.borrow().position
    }

    /// Continue reading with the first record after `position`.
    pub fn seek_after(&mut self, position: i64) -> Result<(), LogStreamError> {
        let boundary = self.storage.boundary();
        if boundary.index > 0 && boundary.position > position {
            return Err(StorageError::Compacted {
                index: boundary.index,
            }
            .into());
        }
        self.buffer.clear();
        self.next_index = self.storage.first_index();
        self.min_position = position;
        Ok(())
    }

    /// Next committed record, or `None` when the reader caught up with the commit index.
    pub fn next_record(&mut self) -> Result<Option<Record>, LogStreamError> {
        loop {
            while let Some(record) = self.buffer.pop_front() {
                if record.position > self.min_position {
                    self.min_position = record.position;
                    return Ok(Some(record));
                }
            }

            let commit_index = self.commit.borrow().index;
            if self.next_index > commit_index {
                return Ok(None);
            }
            if self.next_index < self.storage.first_index() {
                return Err(StorageError::Compacted {
                    index: self.next_index,
                }
                .into());
            }

            let entry = self
                .storage
                .entry(self.next_index)?
                .ok_or(StorageError::Unavailable {
                    index: self.next_index,
                    last_index: self.storage.last_index(),
                })?;
            self.next_index += 1;

            match entry.highest_position() {
                Some(highest) if highest > self.min_position => self.buffer.extend(decode_entry(&entry)?),
                _ => {}
            }
        }
    }

    /// Up to `max` committed records.
    pub fn read_batch(&mut self, max: usize) -> Result<Vec<Record>, LogStreamError> {
        let mut records = Vec::new();
        while records.len() < max {
            match self.next_record()? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok(records)
    }

    /// Wait until the commit watermark changes. Returns false when the log closed.
    pub async fn wait_for_commit(&mut self) -> bool {
        self.commit.changed().await.is_ok()
    }

    pub fn commit_receiver(&self) -> watch::Receiver<CommitWatermark> {
        self.commit.clone()
    }
}
