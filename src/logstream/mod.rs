//! Position-based view over the replicated log
//!
//! Application entries carry a JSON-encoded batch of records. Positions are
//! not stored in the batch: the Raft leader assigns a gap-free range when it
//! appends the entry, and readers number the records from the entry's
//! lowest position.

mod reader;
mod writer;

pub use self::reader::LogStreamReader;
pub use self::writer::{LogAppender, LogStreamWriter};

use crate::protocol::Record;
use crate::raft::entry::{EntryPayload, LogEntry};
use crate::raft::errors::{RaftError, StorageError};
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogStreamError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to encode or decode a record batch: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("append failed: {0}")]
    Append(#[from] RaftError),

    #[error("entry {index} holds {actual} records but spans {expected} positions")]
    BatchMismatch { index: u64, expected: i64, actual: usize },

    #[error("cannot append an empty batch")]
    EmptyBatch,
}

pub fn encode_batch(records: &[Record]) -> Result<Bytes, LogStreamError> {
    if records.is_empty() {
        return Err(LogStreamError::EmptyBatch);
    }
    Ok(Bytes::from(serde_json::to_vec(records)?))
}

/// Records of an entry with their positions assigned; empty for non-application entries.
pub fn decode_entry(entry: &LogEntry) -> Result<Vec<Record>, LogStreamError> {
    match &entry.payload {
        EntryPayload::Application {
            lowest_position,
            highest_position,
            data,
        } => {
            let mut records: Vec<Record> = serde_json::from_slice(data)?;
            let expected = highest_position - lowest_position + 1;
            if records.len() as i64 != expected {
                return Err(LogStreamError::BatchMismatch {
                    index: entry.index,
                    expected,
                    actual: records.len(),
                });
            }
            for (offset, record) in records.iter_mut().enumerate() {
                record.position = lowest_position + offset as i64;
            }
            Ok(records)
        }
        _ => Ok(Vec::new()),
    }
}
