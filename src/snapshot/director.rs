use super::{CompactionPins, FileBasedSnapshotStore, PersistedSnapshot, SnapshotError, SnapshotMetadata, TransientSnapshot};
use crate::actor::{Actor, ActorControl, ActorRef, ActorScheduler, HandlerResult, RetryStrategy, TimerHandle};
use crate::config::SnapshotConfig;
use crate::health::{Fault, HealthMonitor, HealthStatus};
use crate::raft::entry::{Configuration, LogBoundary};
use crate::raft::errors::RaftError;
use crate::raft::node::RaftHandle;
use crate::state::ExporterPositionState;
use crate::stream::StreamProcessorHandle;
use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

const MAILBOX_CAPACITY: usize = 64;

/// The parts of the replicated log the director needs.
#[async_trait]
pub trait SnapshotLog: Send + Sync {
    async fn wait_for_commit_position(&self, position: i64) -> Result<(), RaftError>;

    async fn boundary_for_position(&self, position: i64) -> Result<Option<LogBoundary>, RaftError>;

    async fn compact(&self, index: u64) -> Result<u64, RaftError>;

    /// Last committed membership.
    fn configuration(&self) -> Configuration;

    fn last_index(&self) -> u64;
}

#[async_trait]
impl SnapshotLog for RaftHandle {
    async fn wait_for_commit_position(&self, position: i64) -> Result<(), RaftError> {
        RaftHandle::wait_for_commit_position(self, position).await
    }

    async fn boundary_for_position(&self, position: i64) -> Result<Option<LogBoundary>, RaftError> {
        RaftHandle::boundary_for_position(self, position).await
    }

    async fn compact(&self, index: u64) -> Result<u64, RaftError> {
        RaftHandle::compact(self, index).await
    }

    fn configuration(&self) -> Configuration {
        self.storage().configuration()
    }

    fn last_index(&self) -> u64 {
        self.storage().last_index()
    }
}

#[derive(Clone, Debug)]
pub struct SnapshotDirectorConfig {
    pub partition_id: u32,
    pub period: Duration,
    pub log_growth_threshold: u64,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Exporters whose acknowledged positions bound compaction.
    pub exporter_ids: Vec<String>,
}

impl SnapshotDirectorConfig {
    pub fn new(partition_id: u32, snapshot: &SnapshotConfig, exporter_ids: Vec<String>) -> Self {
        Self {
            partition_id,
            period: Duration::from_millis(snapshot.period_ms),
            log_growth_threshold: snapshot.log_growth_threshold,
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_millis(snapshot.max_retry_delay_ms),
            exporter_ids,
        }
    }
}

type SnapshotReply = oneshot::Sender<Result<Option<SnapshotMetadata>, SnapshotError>>;

pub enum SnapshotMessage {
    /// Periodic trigger: take a snapshot and check the log growth.
    Tick,
    Take(Option<SnapshotReply>),
    /// `None` when nothing changed since the latest snapshot.
    Checkpointed(Result<Option<TransientSnapshot>, SnapshotError>),
    Committed(Result<(i64, Option<LogBoundary>), SnapshotError>),
    Persisted(Result<PersistedSnapshot, SnapshotError>),
    Compacted(Result<u64, RaftError>),
}

/// A snapshot between checkpoint and persist.
struct InProgress {
    /// Lowest pinned position when the snapshot started.
    pin: Option<i64>,
    lower_bound: i64,
    transient: Option<TransientSnapshot>,
}

/// Takes snapshots of a partition's state and compacts the log behind them.
///
/// Runs on every replica. Each step is either an actor continuation or
/// blocking work on the blocking pool, so neither processing nor
/// replication ever waits on it.
pub struct SnapshotDirector {
    config: SnapshotDirectorConfig,
    store: FileBasedSnapshotStore,
    log: Arc<dyn SnapshotLog>,
    processor: watch::Receiver<Option<StreamProcessorHandle>>,
    pins: CompactionPins,
    health: HealthMonitor,
    in_progress: Option<InProgress>,
    waiters: Vec<SnapshotReply>,
    retry: RetryStrategy,
    ticker: Option<TimerHandle>,
    logger: Logger,
}

impl SnapshotDirector {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        scheduler: &ActorScheduler,
        config: SnapshotDirectorConfig,
        store: FileBasedSnapshotStore,
        log: Arc<dyn SnapshotLog>,
        processor: watch::Receiver<Option<StreamProcessorHandle>>,
        pins: CompactionPins,
        health: HealthMonitor,
        logger: Logger,
    ) -> SnapshotDirectorHandle {
        let logger = logger.new(o!("partition" => config.partition_id));
        let director = SnapshotDirector {
            retry: RetryStrategy::new(config.retry_delay, config.max_retry_delay),
            config,
            store,
            log,
            processor,
            pins,
            health,
            in_progress: None,
            waiters: Vec::new(),
            ticker: None,
            logger,
        };
        SnapshotDirectorHandle {
            actor: scheduler.spawn(director, MAILBOX_CAPACITY),
        }
    }

    fn component(&self) -> String {
        format!("snapshot-director-{}", self.config.partition_id)
    }

    fn latest_metadata(&self) -> Option<SnapshotMetadata> {
        self.store.latest().map(|s| s.metadata)
    }

    fn finish(&mut self, result: Result<Option<SnapshotMetadata>, SnapshotError>) {
        self.in_progress = None;
        let reply_with = |e: &SnapshotError| SnapshotError::Aborted(e.to_string());
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(match &result {
                Ok(metadata) => Ok(metadata.clone()),
                Err(e) => Err(reply_with(e)),
            });
        }
    }

    fn fail(&mut self, ctl: &ActorControl<SnapshotMessage>, error: SnapshotError) {
        let delay = self.retry.next_delay();
        warn!(self.logger, "Failed to take snapshot, retrying";
            "error" => %error, "delay_ms" => delay.as_millis() as u64);
        self.health.record_fault(Fault::Snapshot);
        self.health
            .report(&self.component(), HealthStatus::Unhealthy(format!("snapshot failed: {}", error)));
        self.finish(Err(error));
        ctl.schedule(delay, SnapshotMessage::Take(None));
    }

    fn check_log_growth(&self) {
        let compacted = self.latest_metadata().map(|m| m.boundary.index).unwrap_or(0);
        let growth = self.log.last_index().saturating_sub(compacted);
        if growth > self.config.log_growth_threshold {
            self.health.report(
                &self.component(),
                HealthStatus::Unhealthy(format!("{} entries appended since the last snapshot", growth)),
            );
        } else if self.in_progress.is_none() {
            self.health.report(&self.component(), HealthStatus::Healthy);
        }
    }

    fn start(&mut self, ctl: &ActorControl<SnapshotMessage>) {
        let current = self.processor.borrow().clone();
        let Some(processor) = current else {
            debug!(self.logger, "No stream processor running, skipping snapshot");
            let latest = self.latest_metadata();
            return self.finish(Ok(latest));
        };
        let state = processor.state().clone();
        let exported = if self.config.exporter_ids.is_empty() {
            None
        } else {
            match ExporterPositionState::lowest(&state, &self.config.exporter_ids) {
                Ok(lowest) => lowest,
                Err(e) => return self.fail(ctl, e.into()),
            }
        };
        self.in_progress = Some(InProgress {
            pin: self.pins.lowest(),
            lower_bound: -1,
            transient: None,
        });

        let store = self.store.clone();
        let latest = self.latest_metadata();
        ctl.run_on_completion(
            async move {
                let positions = processor
                    .positions()
                    .await
                    .map_err(|e| SnapshotError::Aborted(format!("stream processor unavailable: {}", e)))?;
                let processed = positions.last_processed;
                let exported = exported.unwrap_or(processed);
                if let Some(latest) = &latest {
                    if processed <= latest.id.processed_position && exported <= latest.id.exported_position {
                        return Ok(None);
                    }
                }
                let work = move || store.take_transient(processed, exported, |dir| Ok(state.checkpoint(dir)?));
                let transient = tokio::task::spawn_blocking(work)
                    .await
                    .map_err(|e| SnapshotError::Aborted(e.to_string()))??;
                Ok(Some(transient))
            },
            SnapshotMessage::Checkpointed,
        );
    }

    fn on_checkpointed(&mut self, ctl: &ActorControl<SnapshotMessage>, transient: TransientSnapshot) {
        let current = self.processor.borrow().clone();
        let Some(processor) = current else {
            return self.fail(ctl, SnapshotError::Aborted("stream processor stopped".into()));
        };
        let Some(in_progress) = self.in_progress.as_mut() else {
            return;
        };
        let lower_bound = compaction_bound(
            transient.processed_position(),
            transient.exported_position(),
            in_progress.pin,
        );
        in_progress.lower_bound = lower_bound;
        in_progress.transient = Some(transient);

        let log = self.log.clone();
        ctl.run_on_completion(
            async move {
                // the checkpoint may contain results of records not yet committed
                let positions = processor
                    .positions()
                    .await
                    .map_err(|e| SnapshotError::Aborted(format!("stream processor unavailable: {}", e)))?;
                log.wait_for_commit_position(positions.last_written).await?;
                let boundary = log.boundary_for_position(lower_bound).await?;
                Ok((positions.last_written, boundary))
            },
            SnapshotMessage::Committed,
        );
    }

    fn on_committed(&mut self, ctl: &ActorControl<SnapshotMessage>, last_written: i64, boundary: Option<LogBoundary>) {
        let Some(transient) = self.in_progress.as_mut().and_then(|p| p.transient.take()) else {
            return;
        };
        let Some(boundary) = boundary else {
            debug!(self.logger, "Nothing committed below the snapshot position yet");
            let latest = self.latest_metadata();
            return self.finish(Ok(latest));
        };
        if let Some(latest) = self.latest_metadata() {
            if boundary.index < latest.boundary.index {
                let latest = Some(latest);
                return self.finish(Ok(latest));
            }
        }
        let configuration = self.log.configuration();
        ctl.run_blocking(
            move || transient.persist(boundary, configuration, last_written),
            |result| {
                SnapshotMessage::Persisted(
                    result
                        .map_err(|e| SnapshotError::Aborted(e.to_string()))
                        .and_then(|persisted| persisted),
                )
            },
        );
    }

    fn on_persisted(&mut self, ctl: &ActorControl<SnapshotMessage>, persisted: PersistedSnapshot) {
        let lower_bound = self.in_progress.as_ref().map(|p| p.lower_bound).unwrap_or(-1);
        info!(self.logger, "Took snapshot";
            "snapshot" => %persisted.id(), "lower_bound" => lower_bound, "compact_to" => persisted.metadata.boundary.index);
        self.retry.reset();
        let index = persisted.metadata.boundary.index;
        self.finish(Ok(Some(persisted.metadata)));
        self.check_log_growth();

        let log = self.log.clone();
        ctl.run_on_completion(async move { log.compact(index).await }, SnapshotMessage::Compacted);
    }
}

/// Highest position the log may be compacted to.
pub(crate) fn compaction_bound(processed: i64, exported: i64, pin: Option<i64>) -> i64 {
    let bound = processed.min(exported);
    match pin {
        Some(pin) => bound.min(pin),
        None => bound,
    }
}

#[async_trait]
impl Actor for SnapshotDirector {
    type Message = SnapshotMessage;

    fn name(&self) -> String {
        self.component()
    }

    async fn on_start(&mut self, ctl: &ActorControl<SnapshotMessage>) -> HandlerResult {
        self.ticker = Some(ctl.run_at_fixed_rate(self.config.period, || SnapshotMessage::Tick));
        self.health.report(&self.component(), HealthStatus::Healthy);
        Ok(())
    }

    async fn handle(&mut self, ctl: &ActorControl<SnapshotMessage>, msg: SnapshotMessage) -> HandlerResult {
        match msg {
            SnapshotMessage::Tick => {
                self.check_log_growth();
                if self.in_progress.is_none() {
                    self.start(ctl);
                }
            }
            SnapshotMessage::Take(reply) => {
                if let Some(reply) = reply {
                    self.waiters.push(reply);
                }
                if self.in_progress.is_none() {
                    self.start(ctl);
                }
            }
            SnapshotMessage::Checkpointed(Ok(Some(transient))) => self.on_checkpointed(ctl, transient),
            SnapshotMessage::Checkpointed(Ok(None)) => {
                debug!(self.logger, "No new state since the latest snapshot");
                let latest = self.latest_metadata();
                self.finish(Ok(latest));
            }
            SnapshotMessage::Checkpointed(Err(e)) => self.fail(ctl, e),
            SnapshotMessage::Committed(Ok((last_written, boundary))) => {
                self.on_committed(ctl, last_written, boundary)
            }
            SnapshotMessage::Committed(Err(e)) | SnapshotMessage::Persisted(Err(e)) => self.fail(ctl, e),
            SnapshotMessage::Persisted(Ok(persisted)) => self.on_persisted(ctl, persisted),
            SnapshotMessage::Compacted(Ok(first_index)) => {
                debug!(self.logger, "Compacted log behind snapshot"; "first_index" => first_index);
            }
            SnapshotMessage::Compacted(Err(e)) => {
                warn!(self.logger, "Failed to compact log"; "error" => %e);
                self.health.record_fault(Fault::Snapshot);
            }
        }
        Ok(())
    }

    async fn on_stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel();
        }
        self.finish(Err(SnapshotError::Aborted("snapshot director stopped".into())));
        self.health.remove(&self.component());
    }
}

#[derive(Clone)]
pub struct SnapshotDirectorHandle {
    actor: ActorRef<SnapshotMessage>,
}

impl SnapshotDirectorHandle {
    /// Take a snapshot now, or join the one in progress. `None` when there
    /// is nothing to snapshot yet.
    pub async fn take_snapshot(&self) -> Result<Option<SnapshotMetadata>, SnapshotError> {
        self.actor
            .ask(|reply| SnapshotMessage::Take(Some(reply)))
            .await
            .map_err(|e| SnapshotError::Aborted(e.to_string()))?
    }

    pub async fn stop(&self) {
        self.actor.stop_and_wait().await;
    }
}
