//! Command processors and event appliers
//!
//! The engine is the deterministic core of a partition: given the state and
//! a command it either writes a rejection or accepts the command and writes
//! events, which are applied to the state in the same transaction. Replaying
//! the events of the log through the same appliers rebuilds the state on any
//! replica.

mod appliers;
mod context;
pub mod distribution;
mod processors;

pub use self::context::ProcessingContext;
pub use self::distribution::{CommandRedistributor, InterPartitionCommandSender};

use crate::protocol::{key, Intent, Record, RecordType, RejectionType, ValueType};
use crate::state::{KeyGenerator, StateError, Transaction};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("no applier for event {value_type:?}:{intent:?}")]
    UnknownEvent { value_type: ValueType, intent: Intent },

    #[error("record value does not match value type {0:?}")]
    ValueMismatch(ValueType),

    #[error("{0}")]
    Handler(String),
}

/// Source of processing time. Handlers never read the system clock directly.
pub trait StreamClock: Send + Sync {
    /// Epoch milliseconds.
    fn now_millis(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl StreamClock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Clone, Debug, Default)]
pub struct ControlledClock {
    now: Arc<AtomicI64>,
}

impl ControlledClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl StreamClock for ControlledClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Work done after the processing transaction committed.
#[derive(Clone, Debug, PartialEq)]
pub enum SideEffect {
    /// Append `command` to another partition's log.
    SendCommand { partition_id: u32, command: Record },
    /// A timer with this due date was created.
    TimerScheduled { due_date: i64 },
}

/// Outcome of processing one command.
#[derive(Debug, Default)]
pub struct ProcessingResult {
    /// Follow-up records, in append order.
    pub records: Vec<Record>,
    /// Index into `records` of the record that answers the client.
    pub response: Option<usize>,
    pub side_effects: Vec<SideEffect>,
}

impl ProcessingResult {
    pub fn response(&self) -> Option<&Record> {
        self.response.and_then(|i| self.records.get(i))
    }

    pub fn is_rejection(&self) -> bool {
        self.records.iter().any(Record::is_rejection)
    }
}

/// Partition-scoped engine.
#[derive(Clone)]
pub struct Engine {
    partition_id: u32,
    partition_ids: Vec<u32>,
    clock: Arc<dyn StreamClock>,
}

impl Engine {
    /// `partition_ids` lists every partition of the cluster, this one included.
    pub fn new(partition_id: u32, partition_ids: Vec<u32>, clock: Arc<dyn StreamClock>) -> Self {
        Self {
            partition_id,
            partition_ids,
            clock,
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn partition_ids(&self) -> &[u32] {
        &self.partition_ids
    }

    pub fn clock(&self) -> &Arc<dyn StreamClock> {
        &self.clock
    }

    pub fn key_generator(&self) -> KeyGenerator {
        KeyGenerator::new(self.partition_id)
    }

    /// Process `command` (already appended, so its position is known) within `txn`.
    ///
    /// An `Err` leaves `txn` in an unspecified state; roll it back and write
    /// [`Engine::processing_error`] instead.
    pub fn process(&self, txn: &mut Transaction, command: &Record) -> Result<ProcessingResult, ProcessingError> {
        let mut ctx = ProcessingContext::new(self, txn, command);
        if command.value.value_type() != command.value_type {
            ctx.reject(
                RejectionType::InvalidArgument,
                format!("value does not match value type {:?}", command.value_type),
            );
        } else {
            processors::process(&mut ctx)?;
        }
        Ok(ctx.into_result())
    }

    /// Fold a committed event into the state.
    pub fn replay(&self, txn: &mut Transaction, event: &Record) -> Result<(), ProcessingError> {
        appliers::apply(txn, self.partition_id, event)
    }

    /// The rejection written for a command whose handler failed.
    pub fn processing_error(&self, command: &Record, error: &ProcessingError) -> ProcessingResult {
        let rejection = rejection_for(
            command,
            self.partition_id,
            self.clock.now_millis(),
            RejectionType::ProcessingError,
            format!("Expected to process command, but failed: {}", error),
        );
        ProcessingResult {
            records: vec![rejection],
            response: command.has_request().then_some(0),
            side_effects: Vec::new(),
        }
    }

    /// Whether `command` was sent here by another partition's distribution.
    pub fn is_distributed(&self, command: &Record) -> bool {
        let origin = key::decode_partition_id(command.key);
        command.key >= 0 && origin >= key::START_PARTITION_ID && origin != self.partition_id
    }
}

pub(crate) fn rejection_for(
    command: &Record,
    partition_id: u32,
    timestamp: i64,
    rejection_type: RejectionType,
    reason: String,
) -> Record {
    Record {
        position: key::NONE,
        source_position: command.position,
        key: command.key,
        partition_id,
        record_type: RecordType::CommandRejection,
        value_type: command.value_type,
        intent: command.intent,
        rejection_type: Some(rejection_type),
        rejection_reason: reason,
        request_id: command.request_id,
        request_stream_id: command.request_stream_id,
        timestamp,
        record_version: command.record_version,
        value: command.value.clone(),
    }
}
