use super::ResponseSink;
use crate::actor::{Actor, ActorControl, ActorError, ActorRef, ActorScheduler, HandlerResult, RetryStrategy, TimerHandle};
use crate::config::ProcessingConfig;
use crate::engine::{CommandRedistributor, Engine, InterPartitionCommandSender, ProcessingResult, SideEffect};
use crate::health::{Fault, HealthMonitor, HealthStatus};
use crate::logstream::{LogAppender, LogStreamError, LogStreamReader};
use crate::protocol::{Intent, Record, RecordValue, TimerValue};
use crate::raft::{AppendResult, CommitWatermark, LogStorage, StorageError};
use crate::state::{LastProcessedPositionState, StateDb, StateError, TimerState, Transaction};
use async_trait::async_trait;
use serde::Serialize;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

const MAILBOX_CAPACITY: usize = 256;
/// Records handled per mailbox turn, so queries are served during long replays.
const BATCH_SIZE: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StreamProcessorMode {
    /// Apply committed events only.
    Replay,
    /// Replay, then process commands.
    Processing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Replaying,
    Processing,
    /// The log was compacted under the reader; waiting to be rebuilt from a snapshot.
    Stalled,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessorPositions {
    pub last_processed: i64,
    /// Highest position read or written by this processor.
    pub last_written: i64,
    pub phase: Phase,
}

#[derive(Clone, Debug)]
pub struct StreamProcessorConfig {
    pub partition_id: u32,
    pub mode: StreamProcessorMode,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub due_date_check_interval: Duration,
    pub redistribution_interval: Duration,
    pub max_redistribution_interval: Duration,
}

impl StreamProcessorConfig {
    pub fn new(partition_id: u32, mode: StreamProcessorMode, processing: &ProcessingConfig) -> Self {
        Self {
            partition_id,
            mode,
            retry_delay: Duration::from_millis(processing.retry_delay_ms),
            max_retry_delay: Duration::from_millis(processing.retry_delay_ms * 40),
            due_date_check_interval: Duration::from_millis(processing.due_date_check_interval_ms),
            redistribution_interval: Duration::from_millis(processing.redistribution_interval_ms),
            max_redistribution_interval: Duration::from_millis(processing.max_redistribution_interval_ms),
        }
    }
}

/// Collaborators of a stream processor.
#[derive(Clone)]
pub struct StreamProcessorDeps {
    pub engine: Engine,
    pub state: StateDb,
    pub storage: Arc<dyn LogStorage>,
    pub commit: watch::Receiver<CommitWatermark>,
    pub writer: Arc<dyn LogAppender>,
    pub sender: Arc<dyn InterPartitionCommandSender>,
    pub responses: Arc<dyn ResponseSink>,
    pub health: HealthMonitor,
}

pub enum ProcessorMessage {
    Poll,
    CommitAdvanced(bool),
    Appended(Result<AppendResult, LogStreamError>),
    Retry,
    CheckDueDates,
    Redistribute,
    ScheduledWritten {
        timer_keys: Vec<i64>,
        result: Result<AppendResult, LogStreamError>,
    },
    Positions(oneshot::Sender<ProcessorPositions>),
}

/// The single timer armed for the earliest pending due date.
struct DueDateTimer {
    due_date: i64,
    handle: TimerHandle,
}

struct PendingWrite {
    command: Record,
    txn: Transaction,
    result: ProcessingResult,
}

pub struct StreamProcessor {
    config: StreamProcessorConfig,
    engine: Engine,
    state: StateDb,
    storage: Arc<dyn LogStorage>,
    reader: LogStreamReader,
    writer: Arc<dyn LogAppender>,
    sender: Arc<dyn InterPartitionCommandSender>,
    responses: Arc<dyn ResponseSink>,
    health: HealthMonitor,
    phase: Phase,
    last_processed: i64,
    last_read: i64,
    last_written: i64,
    /// Events caused by commands at or below this position are already in the state.
    replay_floor: i64,
    replay_target: i64,
    pending: Option<PendingWrite>,
    retry_command: Option<Record>,
    retry: RetryStrategy,
    waiting_for_commit: bool,
    /// A `Poll` is queued or about to be; at most one is in flight.
    poll_scheduled: bool,
    redistributor: CommandRedistributor,
    triggering: HashSet<i64>,
    timers: Vec<TimerHandle>,
    due_date_timer: Option<DueDateTimer>,
    logger: Logger,
}

impl StreamProcessor {
    pub fn spawn(
        scheduler: &ActorScheduler,
        config: StreamProcessorConfig,
        deps: StreamProcessorDeps,
        logger: Logger,
    ) -> StreamProcessorHandle {
        let logger = logger.new(o!("partition" => config.partition_id, "mode" => format!("{:?}", config.mode)));
        let reader = LogStreamReader::new(deps.storage.clone(), deps.commit);
        let processor = StreamProcessor {
            retry: RetryStrategy::new(config.retry_delay, config.max_retry_delay),
            redistributor: CommandRedistributor::new(config.redistribution_interval, config.max_redistribution_interval),
            engine: deps.engine,
            state: deps.state.clone(),
            storage: deps.storage,
            reader,
            writer: deps.writer,
            sender: deps.sender,
            responses: deps.responses,
            health: deps.health,
            phase: Phase::Replaying,
            last_processed: -1,
            last_read: -1,
            last_written: -1,
            replay_floor: -1,
            replay_target: -1,
            pending: None,
            retry_command: None,
            waiting_for_commit: false,
            poll_scheduled: false,
            triggering: HashSet::new(),
            timers: Vec::new(),
            due_date_timer: None,
            logger,
            config,
        };
        let mode = processor.config.mode;
        let actor = scheduler.spawn(processor, MAILBOX_CAPACITY);
        StreamProcessorHandle {
            actor,
            state: deps.state,
            mode,
        }
    }

    fn component(&self) -> String {
        format!("stream-processor-{}", self.config.partition_id)
    }

    fn fail(&mut self, reason: String) {
        if self.phase == Phase::Failed {
            return;
        }
        error!(self.logger, "Stream processor failed"; "reason" => &reason);
        self.phase = Phase::Failed;
        self.pending = None;
        self.retry_command = None;
        self.cancel_timers();
        self.health.record_fault(Fault::Processing);
        self.health.report(&self.component(), HealthStatus::Dead(reason));
    }

    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.cancel();
        }
        if let Some(armed) = self.due_date_timer.take() {
            armed.handle.cancel();
        }
    }

    /// Continue the read loop. The request survives a full mailbox.
    fn request_poll(&mut self, ctl: &ActorControl<ProcessorMessage>) {
        if !self.poll_scheduled {
            self.poll_scheduled = true;
            ctl.submit_or_wait(ProcessorMessage::Poll);
        }
    }

    /// Make sure a due date check runs by `due_date`. Keeps the earlier of
    /// the armed date and `due_date`.
    fn arm_due_date_check(&mut self, ctl: &ActorControl<ProcessorMessage>, due_date: i64) {
        if let Some(armed) = &self.due_date_timer {
            if armed.due_date <= due_date && !armed.handle.is_finished() {
                return;
            }
            armed.handle.cancel();
        }
        let delay = (due_date - self.engine.clock().now_millis()).max(0) as u64;
        self.due_date_timer = Some(DueDateTimer {
            due_date,
            handle: ctl.schedule(Duration::from_millis(delay), ProcessorMessage::CheckDueDates),
        });
    }

    /// Reader failure: a compacted log means a snapshot replaced our view and
    /// a rebuild is coming, anything else is fatal.
    fn on_read_error(&mut self, e: LogStreamError) {
        match e {
            LogStreamError::Storage(StorageError::Compacted { index }) => {
                warn!(self.logger, "Log compacted under the reader, waiting for restore"; "index" => index);
                self.phase = Phase::Stalled;
                self.health.report(
                    &self.component(),
                    HealthStatus::Unhealthy(format!("log compacted at index {}", index)),
                );
            }
            e => self.fail(format!("failed to read the log: {}", e)),
        }
    }

    fn wait_for_commit(&mut self, ctl: &ActorControl<ProcessorMessage>) {
        if self.waiting_for_commit {
            return;
        }
        self.waiting_for_commit = true;
        let seen = self.reader.commit_position();
        let mut commit = self.reader.commit_receiver();
        ctl.run_on_completion(
            async move { commit.wait_for(|w| w.position > seen).await.is_ok() },
            ProcessorMessage::CommitAdvanced,
        );
    }

    fn replay_batch(&mut self, ctl: &ActorControl<ProcessorMessage>) {
        let mut txn = self.state.begin();
        let mut count = 0;
        let mut caught_up = false;
        while count < BATCH_SIZE {
            let record = match self.reader.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    caught_up = true;
                    break;
                }
                Err(e) => return self.on_read_error(e),
            };
            count += 1;
            self.last_read = record.position;
            self.last_written = self.last_written.max(record.position);
            if record.is_command() {
                continue;
            }
            if record.is_event() && record.source_position > self.replay_floor {
                if let Err(e) = self.engine.replay(&mut txn, &record) {
                    return self.fail(format!(
                        "failed to replay event at position {}: {}",
                        record.position, e
                    ));
                }
            }
            if record.source_position > self.last_processed {
                self.last_processed = record.source_position;
                if let Err(e) = LastProcessedPositionState::mark_processed(&mut txn, self.last_processed) {
                    return self.fail(e.to_string());
                }
            }
        }
        if let Err(e) = txn.commit() {
            return self.fail(format!("failed to commit replayed state: {}", e));
        }

        let replayed = self.last_read >= self.replay_target
            || (caught_up && self.reader.commit_position() >= self.replay_target);
        if self.config.mode == StreamProcessorMode::Processing && replayed {
            self.start_processing(ctl);
        } else if caught_up {
            self.wait_for_commit(ctl);
        } else {
            self.request_poll(ctl);
        }
    }

    fn start_processing(&mut self, ctl: &ActorControl<ProcessorMessage>) {
        if let Err(e) = self.reader.seek_after(self.last_processed) {
            return self.on_read_error(e);
        }
        info!(self.logger, "Replay finished, processing commands";
            "last_processed" => self.last_processed, "last_read" => self.last_read);
        self.phase = Phase::Processing;
        self.timers.push(ctl.run_at_fixed_rate(self.config.due_date_check_interval, || {
            ProcessorMessage::CheckDueDates
        }));
        self.timers.push(ctl.run_at_fixed_rate(self.config.redistribution_interval, || {
            ProcessorMessage::Redistribute
        }));
        ctl.submit_or_wait(ProcessorMessage::CheckDueDates);
        self.request_poll(ctl);
    }

    fn process_next(&mut self, ctl: &ActorControl<ProcessorMessage>) {
        if self.pending.is_some() || self.retry_command.is_some() {
            return;
        }
        for _ in 0..BATCH_SIZE {
            let record = match self.reader.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => return self.wait_for_commit(ctl),
                Err(e) => return self.on_read_error(e),
            };
            self.last_read = record.position;
            if record.is_command() && record.position > self.last_processed {
                return self.process_command(ctl, record);
            }
        }
        self.request_poll(ctl);
    }

    fn process_command(&mut self, ctl: &ActorControl<ProcessorMessage>, command: Record) {
        let (txn, result) = match self.run_engine(&command) {
            Ok(processed) => processed,
            Err(e) => return self.fail(format!("failed to process command at {}: {}", command.position, e)),
        };

        if result.records.is_empty() {
            if let Err(e) = txn.commit() {
                return self.fail(format!("failed to commit state: {}", e));
            }
            self.last_processed = command.position;
            self.run_side_effects(ctl, &command, result);
            self.request_poll(ctl);
            return;
        }

        let writer = self.writer.clone();
        let records = result.records.clone();
        ctl.run_on_completion(async move { writer.append(records).await }, ProcessorMessage::Appended);
        self.pending = Some(PendingWrite { command, txn, result });
    }

    /// Process `command` in a fresh transaction; a handler error turns into a
    /// `PROCESSING_ERROR` rejection written in a clean transaction.
    fn run_engine(&self, command: &Record) -> Result<(Transaction, ProcessingResult), StateError> {
        let mut txn = self.state.begin();
        let result = match self.engine.process(&mut txn, command) {
            Ok(result) => result,
            Err(e) => {
                warn!(self.logger, "Command processing failed, rejecting";
                    "position" => command.position, "error" => %e);
                self.health.record_fault(Fault::Processing);
                txn.rollback();
                txn = self.state.begin();
                self.engine.processing_error(command, &e)
            }
        };
        LastProcessedPositionState::mark_processed(&mut txn, command.position)?;
        Ok((txn, result))
    }

    fn on_appended(
        &mut self,
        ctl: &ActorControl<ProcessorMessage>,
        appended: Result<AppendResult, LogStreamError>,
    ) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        match appended {
            Ok(appended) => {
                for (offset, record) in pending.result.records.iter_mut().enumerate() {
                    record.position = appended.lowest_position + offset as i64;
                }
                self.last_written = self.last_written.max(appended.highest_position);
                if let Err(e) = pending.txn.commit() {
                    return self.fail(format!("failed to commit state: {}", e));
                }
                self.last_processed = pending.command.position;
                self.retry.reset();
                self.run_side_effects(ctl, &pending.command, pending.result);
                self.request_poll(ctl);
            }
            Err(e) => {
                let delay = self.retry.next_delay();
                warn!(self.logger, "Failed to append follow-up records, retrying";
                    "position" => pending.command.position, "error" => %e, "delay_ms" => delay.as_millis() as u64);
                self.health.record_fault(Fault::Processing);
                pending.txn.rollback();
                self.retry_command = Some(pending.command);
                ctl.schedule(delay, ProcessorMessage::Retry);
            }
        }
    }

    fn run_side_effects(&mut self, ctl: &ActorControl<ProcessorMessage>, command: &Record, result: ProcessingResult) {
        if command.has_request() {
            if let Some(response) = result.response() {
                self.responses
                    .respond(command.request_stream_id, command.request_id, response.clone());
            }
        }
        for effect in result.side_effects {
            match effect {
                SideEffect::SendCommand { partition_id, command } => {
                    self.sender.send_command(partition_id, command);
                }
                SideEffect::TimerScheduled { due_date } => self.arm_due_date_check(ctl, due_date),
            }
        }
    }

    fn check_due_dates(&mut self, ctl: &ActorControl<ProcessorMessage>) -> Result<(), StateError> {
        let now = self.engine.clock().now_millis();
        let due = TimerState::due(&self.state, now)?;
        self.triggering.retain(|key| due.iter().any(|t| t.key == *key));

        let mut timer_keys = Vec::new();
        let mut commands = Vec::new();
        for timer in due {
            if self.triggering.insert(timer.key) {
                timer_keys.push(timer.key);
                commands.push(Record::command(
                    timer.key,
                    Intent::Trigger,
                    RecordValue::Timer(TimerValue {
                        instance_key: timer.instance_key,
                        due_date: timer.due_date,
                    }),
                ));
            }
        }
        if !commands.is_empty() {
            debug!(self.logger, "Triggering due timers"; "count" => commands.len());
            self.write_commands(ctl, commands, timer_keys);
        }

        if let Some(armed) = self.due_date_timer.take_if(|armed| armed.due_date <= now) {
            armed.handle.cancel();
        }
        if let Some(next) = TimerState::next_due_date_after(&self.state, now)? {
            self.arm_due_date_check(ctl, next);
        }
        Ok(())
    }

    fn redistribute(&mut self, ctl: &ActorControl<ProcessorMessage>) -> Result<(), StateError> {
        let now = self.engine.clock().now_millis();
        let round = self
            .redistributor
            .run_retry_cycle(&self.state, now, self.engine.partition_ids())?;
        for (partition_id, command) in round.resend {
            debug!(self.logger, "Redistributing command"; "key" => command.key, "target" => partition_id);
            self.sender.send_command(partition_id, command);
        }
        if !round.dropped.is_empty() {
            self.write_commands(ctl, round.dropped, Vec::new());
        }
        Ok(())
    }

    /// Append commands that were not triggered by a client.
    fn write_commands(&self, ctl: &ActorControl<ProcessorMessage>, commands: Vec<Record>, timer_keys: Vec<i64>) {
        let writer = self.writer.clone();
        ctl.run_on_completion(async move { writer.append(commands).await }, move |result| {
            ProcessorMessage::ScheduledWritten { timer_keys, result }
        });
    }

    fn positions(&self) -> ProcessorPositions {
        ProcessorPositions {
            last_processed: self.last_processed,
            last_written: self.last_written,
            phase: self.phase,
        }
    }
}

#[async_trait]
impl Actor for StreamProcessor {
    type Message = ProcessorMessage;

    fn name(&self) -> String {
        self.component()
    }

    async fn on_start(&mut self, ctl: &ActorControl<ProcessorMessage>) -> HandlerResult {
        self.last_processed = LastProcessedPositionState::get(&self.state)?;
        self.replay_floor = self.last_processed;
        self.last_read = self.last_processed;
        self.last_written = self.last_processed;
        self.replay_target = self.storage.last_position();
        self.phase = Phase::Replaying;
        self.health.report(&self.component(), HealthStatus::Healthy);
        info!(self.logger, "Stream processor started";
            "last_processed" => self.last_processed, "replay_target" => self.replay_target);

        if let Err(e) = self.reader.seek_after(self.last_processed) {
            self.on_read_error(e);
            return Ok(());
        }
        self.request_poll(ctl);
        Ok(())
    }

    async fn handle(&mut self, ctl: &ActorControl<ProcessorMessage>, msg: ProcessorMessage) -> HandlerResult {
        if matches!(msg, ProcessorMessage::Poll) {
            self.poll_scheduled = false;
        }
        match msg {
            ProcessorMessage::Positions(reply) => {
                let _ = reply.send(self.positions());
            }
            _ if matches!(self.phase, Phase::Failed | Phase::Stalled) => {}
            ProcessorMessage::Poll => match self.phase {
                Phase::Replaying => self.replay_batch(ctl),
                Phase::Processing => self.process_next(ctl),
                Phase::Stalled | Phase::Failed => {}
            },
            ProcessorMessage::CommitAdvanced(open) => {
                self.waiting_for_commit = false;
                if open {
                    self.request_poll(ctl);
                } else {
                    debug!(self.logger, "Commit watermark closed");
                }
            }
            ProcessorMessage::Appended(result) => self.on_appended(ctl, result),
            ProcessorMessage::Retry => {
                if let Some(command) = self.retry_command.take() {
                    self.process_command(ctl, command);
                }
            }
            ProcessorMessage::CheckDueDates if self.phase == Phase::Processing => self.check_due_dates(ctl)?,
            ProcessorMessage::Redistribute if self.phase == Phase::Processing => self.redistribute(ctl)?,
            ProcessorMessage::CheckDueDates | ProcessorMessage::Redistribute => {}
            ProcessorMessage::ScheduledWritten { timer_keys, result } => {
                if let Err(e) = result {
                    warn!(self.logger, "Failed to write scheduled commands"; "error" => %e);
                    for key in timer_keys {
                        self.triggering.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_stop(&mut self) {
        self.cancel_timers();
        if self.phase != Phase::Failed {
            self.health.remove(&self.component());
        }
        info!(self.logger, "Stream processor stopped"; "last_processed" => self.last_processed);
    }
}

/// Handle to a running stream processor.
#[derive(Clone)]
pub struct StreamProcessorHandle {
    actor: ActorRef<ProcessorMessage>,
    state: StateDb,
    mode: StreamProcessorMode,
}

impl StreamProcessorHandle {
    pub fn mode(&self) -> StreamProcessorMode {
        self.mode
    }

    /// The processor's state store. Reads see committed state only.
    pub fn state(&self) -> &StateDb {
        &self.state
    }

    pub async fn positions(&self) -> Result<ProcessorPositions, ActorError> {
        self.actor.ask(ProcessorMessage::Positions).await
    }

    pub fn is_closed(&self) -> bool {
        self.actor.is_closed()
    }

    pub async fn stop(&self) {
        self.actor.stop_and_wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ControlledClock;
    use crate::logging::test_logger;
    use crate::logstream::encode_batch;
    use crate::protocol::{InstanceValue, RecordType, RejectionType};
    use crate::raft::{Configuration, EntryPayload, LogEntry, MemLogStorage, RaftError};
    use crate::state::InstanceState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Single-replica log: appends are committed immediately.
    struct LocalLog {
        storage: Arc<MemLogStorage>,
        commit: watch::Sender<CommitWatermark>,
        fail_appends: AtomicUsize,
    }

    impl LocalLog {
        fn new() -> Arc<Self> {
            let (commit, _) = watch::channel(CommitWatermark::default());
            Arc::new(Self {
                storage: Arc::new(MemLogStorage::new(Configuration::new([1]))),
                commit,
                fail_appends: AtomicUsize::new(0),
            })
        }

        fn records(&self) -> Vec<Record> {
            let mut records = Vec::new();
            for index in self.storage.first_index()..=self.storage.last_index() {
                let entry = self.storage.entry(index).unwrap().unwrap();
                records.extend(crate::logstream::decode_entry(&entry).unwrap());
            }
            records
        }
    }

    #[async_trait]
    impl LogAppender for LocalLog {
        async fn append(&self, records: Vec<Record>) -> Result<AppendResult, LogStreamError> {
            if self.fail_appends.load(Ordering::SeqCst) > 0 {
                self.fail_appends.fetch_sub(1, Ordering::SeqCst);
                return Err(RaftError::Fatal("disk full".into()).into());
            }
            let lowest = self.storage.last_position() + 1;
            let highest = lowest + records.len() as i64 - 1;
            let index = self.storage.last_index() + 1;
            self.storage.append(&[LogEntry {
                index,
                term: 1,
                payload: EntryPayload::Application {
                    lowest_position: lowest,
                    highest_position: highest,
                    data: encode_batch(&records)?,
                },
            }])?;
            self.commit.send_replace(CommitWatermark {
                index,
                position: highest,
            });
            Ok(AppendResult {
                index,
                lowest_position: lowest,
                highest_position: highest,
            })
        }
    }

    #[derive(Default)]
    struct Responses(Mutex<Vec<(i64, Record)>>);

    impl ResponseSink for Responses {
        fn respond(&self, _request_stream_id: i32, request_id: i64, response: Record) {
            self.0.lock().unwrap().push((request_id, response));
        }
    }

    #[derive(Default)]
    struct Sent(Mutex<Vec<(u32, Record)>>);

    impl InterPartitionCommandSender for Sent {
        fn send_command(&self, receiver_partition_id: u32, command: Record) {
            self.0.lock().unwrap().push((receiver_partition_id, command));
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        log: Arc<LocalLog>,
        state: StateDb,
        responses: Arc<Responses>,
        clock: ControlledClock,
        health: HealthMonitor,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let state = StateDb::open(dir.path()).unwrap();
            Self {
                _dir: dir,
                log: LocalLog::new(),
                state,
                responses: Arc::new(Responses::default()),
                clock: ControlledClock::new(1_000),
                health: HealthMonitor::new(test_logger()),
            }
        }

        fn spawn(&self, mode: StreamProcessorMode) -> StreamProcessorHandle {
            let mut processing = ProcessingConfig::default();
            processing.retry_delay_ms = 10;
            processing.due_date_check_interval_ms = 20;
            let deps = StreamProcessorDeps {
                engine: Engine::new(1, vec![1], Arc::new(self.clock.clone())),
                state: self.state.clone(),
                storage: self.log.storage.clone(),
                commit: self.log.commit.subscribe(),
                writer: self.log.clone(),
                sender: Arc::new(Sent::default()),
                responses: self.responses.clone(),
                health: self.health.clone(),
            };
            StreamProcessor::spawn(
                &ActorScheduler::current(test_logger()),
                StreamProcessorConfig::new(1, mode, &processing),
                deps,
                test_logger(),
            )
        }

        async fn write(&self, command: Record) -> AppendResult {
            self.log.append(vec![command]).await.unwrap()
        }
    }

    fn create(key: i64, request_id: i64) -> Record {
        Record::command(
            key,
            Intent::Create,
            RecordValue::Instance(InstanceValue {
                type_name: "Foo".into(),
                ..Default::default()
            }),
        )
        .with_request(1, request_id)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_processes_command_and_responds() {
        let fixture = Fixture::new();
        let processor = fixture.spawn(StreamProcessorMode::Processing);
        fixture.write(create(7, 1)).await;

        let responses = fixture.responses.clone();
        wait_until(|| !responses.0.lock().unwrap().is_empty()).await;
        let (request_id, response) = responses.0.lock().unwrap()[0].clone();
        assert_eq!(request_id, 1);
        assert_eq!(response.intent, Intent::Created);
        assert_eq!(response.position, 2);
        assert_eq!(response.source_position, 1);

        let positions = processor.positions().await.unwrap();
        assert_eq!(positions.last_processed, 1);
        assert_eq!(positions.phase, Phase::Processing);
        assert!(InstanceState::get(&fixture.state, 7).unwrap().is_some());
        processor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejection_is_written_to_the_log() {
        let fixture = Fixture::new();
        let processor = fixture.spawn(StreamProcessorMode::Processing);
        fixture.write(create(7, 1)).await;
        fixture.write(create(7, 2)).await;

        let responses = fixture.responses.clone();
        wait_until(|| responses.0.lock().unwrap().len() == 2).await;
        let records = fixture.log.records();
        let rejections: Vec<&Record> = records.iter().filter(|r| r.is_rejection()).collect();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].rejection_type, Some(RejectionType::AlreadyExists));
        assert_eq!(records.iter().filter(|r| r.record_type == RecordType::Event).count(), 1);
        processor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_append_rolls_back_and_retries() {
        let fixture = Fixture::new();
        let processor = fixture.spawn(StreamProcessorMode::Processing);
        fixture.log.fail_appends.store(2, Ordering::SeqCst);
        // the client command goes straight to storage, bypassing the failing appender
        let command = create(7, 1);
        let index = fixture.log.storage.last_index() + 1;
        fixture
            .log
            .storage
            .append(&[LogEntry {
                index,
                term: 1,
                payload: EntryPayload::Application {
                    lowest_position: 1,
                    highest_position: 1,
                    data: encode_batch(&[command]).unwrap(),
                },
            }])
            .unwrap();
        fixture.log.commit.send_replace(CommitWatermark { index, position: 1 });

        let responses = fixture.responses.clone();
        wait_until(|| !responses.0.lock().unwrap().is_empty()).await;
        assert_eq!(fixture.log.fail_appends.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.log.records().iter().filter(|r| r.is_event()).count(), 1);
        assert!(fixture.health.report_snapshot().processing_faults >= 2);
        processor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replay_then_resume_processing() {
        let fixture = Fixture::new();
        let leader = fixture.spawn(StreamProcessorMode::Processing);
        fixture.write(create(7, 1)).await;
        let responses = fixture.responses.clone();
        wait_until(|| !responses.0.lock().unwrap().is_empty()).await;
        leader.stop().await;

        // a command appended while nobody processed
        fixture.write(create(8, 2)).await;

        let fresh = tempfile::tempdir().unwrap();
        let replica_state = StateDb::open(fresh.path()).unwrap();
        let follower = Fixture {
            _dir: fresh,
            log: fixture.log.clone(),
            state: replica_state.clone(),
            responses: Arc::new(Responses::default()),
            clock: fixture.clock.clone(),
            health: fixture.health.clone(),
        };
        let replayer = follower.spawn(StreamProcessorMode::Replay);
        let handle = replayer.clone();
        let mut positions = handle.positions().await.unwrap();
        for _ in 0..100 {
            if positions.last_processed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            positions = handle.positions().await.unwrap();
        }
        assert_eq!(positions.phase, Phase::Replaying);
        assert_eq!(positions.last_processed, 1);
        assert!(InstanceState::get(&replica_state, 7).unwrap().is_some());
        assert!(InstanceState::get(&replica_state, 8).unwrap().is_none());
        replayer.stop().await;

        let new_leader = fixture.spawn(StreamProcessorMode::Processing);
        wait_until(|| responses.0.lock().unwrap().len() == 2).await;
        assert!(InstanceState::get(&fixture.state, 8).unwrap().is_some());
        assert_eq!(new_leader.positions().await.unwrap().last_processed, 3);
        new_leader.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_due_timer_is_triggered() {
        let fixture = Fixture::new();
        let processor = fixture.spawn(StreamProcessorMode::Processing);
        fixture.write(create(7, 1)).await;
        fixture
            .write(Record::command(
                -1,
                Intent::Create,
                RecordValue::Timer(TimerValue {
                    instance_key: 7,
                    due_date: 2_000,
                }),
            ))
            .await;
        let state = fixture.state.clone();
        wait_until(|| TimerState::all(&state).unwrap().len() == 1).await;

        fixture.clock.set(2_500);
        wait_until(|| TimerState::all(&state).unwrap().is_empty()).await;
        let records = fixture.log.records();
        assert!(records
            .iter()
            .any(|r| r.intent == Intent::Triggered && r.record_type == RecordType::Event));
        assert_eq!(records.iter().filter(|r| r.intent == Intent::Trigger).count(), 1);
        processor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commands_are_processed_while_mailbox_is_flooded() {
        let fixture = Fixture::new();
        let processor = fixture.spawn(StreamProcessorMode::Processing);
        fixture.write(create(7, 1)).await;
        let responses = fixture.responses.clone();
        wait_until(|| responses.0.lock().unwrap().len() == 1).await;

        // many more waiting senders than mailbox slots while commands arrive
        let flood: Vec<_> = (0..MAILBOX_CAPACITY * 4)
            .map(|_| {
                let actor = processor.actor.clone();
                tokio::spawn(async move { actor.tell(ProcessorMessage::CheckDueDates).await })
            })
            .collect();
        for request_id in 2..=6 {
            fixture.write(create(request_id * 10, request_id)).await;
        }
        for task in flood {
            task.await.unwrap().unwrap();
        }
        wait_until(|| responses.0.lock().unwrap().len() == 6).await;

        fixture.write(create(100, 100)).await;
        wait_until(|| responses.0.lock().unwrap().len() == 7).await;
        assert!(InstanceState::get(&fixture.state, 100).unwrap().is_some());
        let positions = processor.positions().await.unwrap();
        assert_eq!(positions.phase, Phase::Processing);
        assert_eq!(positions.last_processed, fixture.log.storage.last_position() - 1);
        processor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timers_with_the_same_due_date_are_triggered_once_each() {
        let fixture = Fixture::new();
        let processor = fixture.spawn(StreamProcessorMode::Processing);
        fixture.write(create(7, 1)).await;
        let timers: Vec<Record> = (0..300)
            .map(|_| {
                Record::command(
                    -1,
                    Intent::Create,
                    RecordValue::Timer(TimerValue {
                        instance_key: 7,
                        due_date: 2_000,
                    }),
                )
            })
            .collect();
        fixture.log.append(timers).await.unwrap();
        let state = fixture.state.clone();
        wait_until(|| TimerState::all(&state).unwrap().len() == 300).await;

        fixture.clock.set(2_500);
        wait_until(|| TimerState::all(&state).unwrap().is_empty()).await;
        let records = fixture.log.records();
        let triggers = records
            .iter()
            .filter(|r| r.intent == Intent::Trigger && r.is_command())
            .count();
        let triggered = records
            .iter()
            .filter(|r| r.intent == Intent::Triggered && r.is_event())
            .count();
        assert_eq!(triggers, 300);
        assert_eq!(triggered, 300);

        // the partition keeps going after the burst
        fixture.write(create(8, 2)).await;
        let responses = fixture.responses.clone();
        wait_until(|| responses.0.lock().unwrap().iter().any(|(id, _)| *id == 2)).await;
        processor.stop().await;
    }
}
