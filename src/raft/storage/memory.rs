//! In-memory log storage, used by tests and simulated clusters.

use super::{highest_position, LogStorage};
use crate::raft::entry::{Configuration, HardState, LogBoundary, LogEntry};
use crate::raft::errors::StorageError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Inner {
    hard_state: HardState,
    configuration: Configuration,
    boundary: LogBoundary,
    /// `entries[i]` has index `boundary.index + 1 + i`.
    entries: Vec<LogEntry>,
    last_position: i64,
}

impl Inner {
    fn last_index(&self) -> u64 {
        self.boundary.index + self.entries.len() as u64
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.boundary.index || index > self.last_index() {
            None
        } else {
            Some((index - self.boundary.index - 1) as usize)
        }
    }

    fn recompute_last_position(&mut self) {
        self.last_position =
            highest_position(self.entries.iter()).unwrap_or(self.boundary.position);
    }
}

#[derive(Default)]
pub struct MemLogStorage {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
}

impl MemLogStorage {
    pub fn new(configuration: Configuration) -> Self {
        let storage = Self::default();
        storage.write().configuration = configuration;
        storage
    }

    /// Make every subsequent write fail, simulating a broken disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Io("simulated disk failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogStorage for MemLogStorage {
    fn hard_state(&self) -> HardState {
        self.read().hard_state
    }

    fn save_hard_state(&self, hs: HardState) -> Result<(), StorageError> {
        self.check_writable()?;
        self.write().hard_state = hs;
        Ok(())
    }

    fn configuration(&self) -> Configuration {
        self.read().configuration.clone()
    }

    fn save_configuration(&self, configuration: &Configuration) -> Result<(), StorageError> {
        self.check_writable()?;
        self.write().configuration = configuration.clone();
        Ok(())
    }

    fn boundary(&self) -> LogBoundary {
        self.read().boundary
    }

    fn last_index(&self) -> u64 {
        self.read().last_index()
    }

    fn last_position(&self) -> i64 {
        self.read().last_position
    }

    fn entry(&self, index: u64) -> Result<Option<LogEntry>, StorageError> {
        let inner = self.read();
        Ok(inner.offset(index).map(|i| inner.entries[i].clone()))
    }

    fn entries(&self, low: u64, high: u64, max: usize) -> Result<Vec<LogEntry>, StorageError> {
        let inner = self.read();
        if low <= inner.boundary.index {
            return Err(StorageError::Compacted { index: low });
        }
        let high = high.min(inner.last_index() + 1);
        if low >= high {
            return Ok(Vec::new());
        }
        let start = (low - inner.boundary.index - 1) as usize;
        let end = (high - inner.boundary.index - 1) as usize;
        Ok(inner.entries[start..end].iter().take(max).cloned().collect())
    }

    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.check_writable()?;
        let mut inner = self.write();
        let mut expected = inner.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::NonContiguous {
                    expected,
                    actual: entry.index,
                });
            }
            expected += 1;
        }
        inner.entries.extend_from_slice(entries);
        if let Some(position) = highest_position(entries.iter()) {
            inner.last_position = position;
        }
        Ok(())
    }

    fn truncate_suffix(&self, from: u64) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.write();
        if from <= inner.boundary.index {
            return Err(StorageError::Compacted { index: from });
        }
        if let Some(offset) = inner.offset(from) {
            inner.entries.truncate(offset);
            inner.recompute_last_position();
        }
        Ok(())
    }

    fn compact(&self, through: u64) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.write();
        if through <= inner.boundary.index {
            return Ok(());
        }
        let offset = inner.offset(through).ok_or(StorageError::Unavailable {
            index: through,
            last_index: inner.last_index(),
        })?;
        let removed: Vec<LogEntry> = inner.entries.drain(..=offset).collect();
        let term = removed.last().map(|e| e.term).unwrap_or(inner.boundary.term);
        let position = highest_position(removed.iter()).unwrap_or(inner.boundary.position);
        inner.boundary = LogBoundary {
            index: through,
            term,
            position,
        };
        Ok(())
    }

    fn reset(&self, boundary: LogBoundary) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.write();
        inner.entries.clear();
        inner.boundary = boundary;
        inner.last_position = boundary.position;
        Ok(())
    }
}
