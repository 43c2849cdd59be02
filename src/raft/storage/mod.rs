//! Durable log storage for a partition's Raft group
//!
//! Two implementations: [`RocksLogStorage`] for brokers and [`MemLogStorage`]
//! for tests. Both use interior mutability so that the Raft node (the only
//! writer) and log readers (stream processor, exporters, backups) can share
//! one `Arc<dyn LogStorage>`. Readers only ever look at committed entries,
//! which the writer never truncates.

mod memory;
mod rocks;

pub use self::memory::MemLogStorage;
pub use self::rocks::RocksLogStorage;

use crate::raft::entry::{Configuration, HardState, LogBoundary, LogEntry};
use crate::raft::errors::StorageError;

pub trait LogStorage: Send + Sync {
    fn hard_state(&self) -> HardState;

    /// Persist `hs`; must be durable when this returns.
    fn save_hard_state(&self, hs: HardState) -> Result<(), StorageError>;

    /// Last committed configuration (from bootstrap, a snapshot or a committed config entry).
    fn configuration(&self) -> Configuration;

    fn save_configuration(&self, configuration: &Configuration) -> Result<(), StorageError>;

    fn boundary(&self) -> LogBoundary;

    fn first_index(&self) -> u64 {
        self.boundary().index + 1
    }

    fn last_index(&self) -> u64;

    /// Highest record position in the log, or the boundary position when the
    /// log holds no application entries.
    fn last_position(&self) -> i64;

    /// Entry at `index`, `None` when compacted or beyond the last index.
    fn entry(&self, index: u64) -> Result<Option<LogEntry>, StorageError>;

    /// Entries in `[low, high)`, at most `max` of them.
    fn entries(&self, low: u64, high: u64, max: usize) -> Result<Vec<LogEntry>, StorageError>;

    /// Term of the entry at `index`; `None` when it is unknown (compacted past
    /// the boundary or beyond the last index).
    fn term(&self, index: u64) -> Result<Option<u64>, StorageError> {
        let boundary = self.boundary();
        if index == boundary.index {
            return Ok(Some(boundary.term));
        }
        if index < boundary.index {
            return Ok(None);
        }
        Ok(self.entry(index)?.map(|e| e.term))
    }

    /// Append entries directly following the last index. Durable on return.
    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove all entries with index `>= from`.
    fn truncate_suffix(&self, from: u64) -> Result<(), StorageError>;

    /// Remove all entries with index `<= through`, moving the boundary there.
    fn compact(&self, through: u64) -> Result<(), StorageError>;

    /// Drop the whole log and restart it after `boundary` (snapshot install).
    fn reset(&self, boundary: LogBoundary) -> Result<(), StorageError>;
}

/// Highest record position among `entries`, scanning from the back.
pub(crate) fn highest_position<'a, I>(entries: I) -> Option<i64>
where
    I: DoubleEndedIterator<Item = &'a LogEntry>,
{
    entries.rev().find_map(LogEntry::highest_position)
}
