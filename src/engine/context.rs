use super::{appliers, rejection_for, Engine, ProcessingError, ProcessingResult, SideEffect};
use crate::protocol::{key, Intent, Record, RecordType, RecordValue, RejectionType, RECORD_VERSION};
use crate::state::{StateError, Transaction};

/// What a command processor sees and writes while handling one command.
///
/// Events are applied to the transaction as soon as they are written, so a
/// processor reads its own effects.
pub struct ProcessingContext<'a> {
    engine: &'a Engine,
    txn: &'a mut Transaction,
    command: &'a Record,
    timestamp: i64,
    result: ProcessingResult,
}

impl<'a> ProcessingContext<'a> {
    pub(crate) fn new(engine: &'a Engine, txn: &'a mut Transaction, command: &'a Record) -> Self {
        Self {
            engine,
            txn,
            command,
            timestamp: engine.clock().now_millis(),
            result: ProcessingResult::default(),
        }
    }

    pub fn command(&self) -> &'a Record {
        self.command
    }

    pub fn partition_id(&self) -> u32 {
        self.engine.partition_id()
    }

    /// Every partition other than this one.
    pub fn other_partitions(&self) -> Vec<u32> {
        self.engine
            .partition_ids()
            .iter()
            .copied()
            .filter(|p| *p != self.engine.partition_id())
            .collect()
    }

    pub fn is_distributed(&self) -> bool {
        self.engine.is_distributed(self.command)
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn state(&self) -> &Transaction {
        &*self.txn
    }

    pub fn next_key(&mut self) -> Result<i64, StateError> {
        self.engine.key_generator().next_key(self.txn)
    }

    /// Write an event and apply it. Returns its index among the follow-up records.
    pub fn append_event(&mut self, key: i64, intent: Intent, value: RecordValue) -> Result<usize, ProcessingError> {
        let event = Record {
            position: key::NONE,
            source_position: self.command.position,
            key,
            partition_id: self.engine.partition_id(),
            record_type: RecordType::Event,
            value_type: value.value_type(),
            intent,
            rejection_type: None,
            rejection_reason: String::new(),
            request_id: -1,
            request_stream_id: -1,
            timestamp: self.timestamp,
            record_version: RECORD_VERSION,
            value,
        };
        appliers::apply(self.txn, self.engine.partition_id(), &event)?;
        self.result.records.push(event);
        Ok(self.result.records.len() - 1)
    }

    /// Answer the client with the record at `index`, if a client waits.
    pub fn respond_with(&mut self, index: usize) {
        if self.command.has_request() {
            self.result.response = Some(index);
        }
    }

    /// Write the command's rejection. The state must not have been touched.
    pub fn reject(&mut self, rejection_type: RejectionType, reason: impl Into<String>) {
        let rejection = rejection_for(
            self.command,
            self.engine.partition_id(),
            self.timestamp,
            rejection_type,
            reason.into(),
        );
        self.result.records.push(rejection);
        let index = self.result.records.len() - 1;
        self.respond_with(index);
    }

    pub fn side_effect(&mut self, effect: SideEffect) {
        self.result.side_effects.push(effect);
    }

    pub(crate) fn into_result(self) -> ProcessingResult {
        self.result
    }
}
