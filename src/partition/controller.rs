//! Role transitions of one partition replica
//!
//! The controller owns the runtime of a partition: the state store, the
//! stream processor and, on the leader, the exporter director. Whenever the
//! replica's role changes or a snapshot from the leader replaces its log,
//! the runtime is torn down and rebuilt from the latest snapshot.

use super::PartitionError;
use crate::actor::{Actor, ActorControl, ActorScheduler, HandlerResult, RetryStrategy};
use crate::config::{ExporterConfig, ProcessingConfig};
use crate::engine::{Engine, InterPartitionCommandSender};
use crate::exporter::{ExporterDirector, ExporterDirectorConfig, ExporterFeed};
use crate::health::{HealthMonitor, HealthStatus};
use crate::logstream::{LogAppender, LogStreamWriter};
use crate::raft::{RaftEvent, RaftHandle, Role};
use crate::snapshot::FileBasedSnapshotStore;
use crate::state::migration::DbMigrator;
use crate::state::StateDb;
use crate::stream::{ResponseSink, StreamProcessor, StreamProcessorConfig, StreamProcessorDeps, StreamProcessorHandle, StreamProcessorMode};
use async_trait::async_trait;
use slog::{error, info, o, warn, Logger};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

pub(crate) const MAILBOX_CAPACITY: usize = 64;

pub enum ControllerMessage {
    Event {
        event: Result<RaftEvent, RecvError>,
        events: broadcast::Receiver<RaftEvent>,
    },
    /// Rebuild the runtime even if the role did not change.
    Rebuild,
}

/// Everything the controller needs to build a runtime.
pub(crate) struct ControllerContext {
    pub partition_id: u32,
    pub scheduler: ActorScheduler,
    pub raft: RaftHandle,
    pub store: FileBasedSnapshotStore,
    pub runtime_dir: PathBuf,
    pub engine: Engine,
    pub processing: ProcessingConfig,
    pub exporters: ExporterConfig,
    pub sender: Arc<dyn InterPartitionCommandSender>,
    pub responses: Arc<dyn ResponseSink>,
    pub processor_tx: watch::Sender<Option<StreamProcessorHandle>>,
    pub exporter_tx: watch::Sender<Option<ExporterFeed>>,
    pub health: HealthMonitor,
}

struct Runtime {
    mode: StreamProcessorMode,
    term: u64,
    processor: StreamProcessorHandle,
    exporter: Option<ExporterFeed>,
}

pub(crate) struct PartitionController {
    ctx: ControllerContext,
    current: Option<Runtime>,
    generation: u64,
    failed: bool,
    retry: RetryStrategy,
    logger: Logger,
}

impl PartitionController {
    pub fn new(ctx: ControllerContext, logger: Logger) -> Self {
        let retry_delay = Duration::from_millis(ctx.processing.retry_delay_ms);
        Self {
            logger: logger.new(o!("partition" => ctx.partition_id)),
            retry: RetryStrategy::new(retry_delay, retry_delay * 40),
            ctx,
            current: None,
            generation: 0,
            failed: false,
        }
    }

    fn component(&self) -> String {
        format!("partition-{}", self.ctx.partition_id)
    }

    fn listen(ctl: &ActorControl<ControllerMessage>, mut events: broadcast::Receiver<RaftEvent>) {
        ctl.run_on_completion(
            async move {
                let event = events.recv().await;
                (event, events)
            },
            |(event, events)| ControllerMessage::Event { event, events },
        );
    }

    /// Bring the runtime in line with the replica's role. With `force` the
    /// runtime is rebuilt even when the role is unchanged.
    async fn reconcile(&mut self, ctl: &ActorControl<ControllerMessage>, force: bool) {
        if self.failed {
            return;
        }
        let role = self.ctx.raft.role();
        let mode = if role.role == Role::Leader {
            StreamProcessorMode::Processing
        } else {
            StreamProcessorMode::Replay
        };
        let up_to_date = self.current.as_ref().is_some_and(|runtime| {
            runtime.mode == mode && (mode == StreamProcessorMode::Replay || runtime.term == role.term)
        });
        if up_to_date && !force {
            return;
        }

        self.teardown().await;
        match self.install(mode, role.term).await {
            Ok(runtime) => {
                self.retry.reset();
                info!(self.logger, "Partition runtime installed";
                    "mode" => ?runtime.mode, "term" => runtime.term, "generation" => self.generation);
                self.ctx.processor_tx.send_replace(Some(runtime.processor.clone()));
                self.ctx.exporter_tx.send_replace(runtime.exporter.clone());
                self.ctx.health.report(&self.component(), HealthStatus::Healthy);
                self.current = Some(runtime);
            }
            Err(e) => {
                let delay = self.retry.next_delay();
                warn!(self.logger, "Failed to install partition runtime, retrying";
                    "error" => %e, "delay_ms" => delay.as_millis() as u64);
                self.ctx
                    .health
                    .report(&self.component(), HealthStatus::Unhealthy(format!("failed to install runtime: {}", e)));
                ctl.schedule(delay, ControllerMessage::Rebuild);
            }
        }
    }

    async fn teardown(&mut self) {
        self.ctx.processor_tx.send_replace(None);
        self.ctx.exporter_tx.send_replace(None);
        if let Some(runtime) = self.current.take() {
            if let Some(exporter) = &runtime.exporter {
                exporter.stop().await;
            }
            runtime.processor.stop().await;
        }
    }

    async fn install(&mut self, mode: StreamProcessorMode, term: u64) -> Result<Runtime, PartitionError> {
        self.generation += 1;
        let state_dir = self.ctx.runtime_dir.join(format!("state-{}", self.generation));
        let runtime_dir = self.ctx.runtime_dir.clone();
        let store = self.ctx.store.clone();
        let logger = self.logger.clone();
        let state = tokio::task::spawn_blocking(move || prepare_state(&runtime_dir, &state_dir, &store, logger))
            .await
            .map_err(|e| PartitionError::Io(std::io::Error::other(e)))??;

        let raft = &self.ctx.raft;
        let writer: Arc<dyn LogAppender> = Arc::new(LogStreamWriter::new(raft.clone()));
        let deps = StreamProcessorDeps {
            engine: self.ctx.engine.clone(),
            state: state.clone(),
            storage: raft.storage(),
            commit: raft.subscribe_commit(),
            writer: writer.clone(),
            sender: self.ctx.sender.clone(),
            responses: self.ctx.responses.clone(),
            health: self.ctx.health.clone(),
        };
        let processor = StreamProcessor::spawn(
            &self.ctx.scheduler,
            StreamProcessorConfig::new(self.ctx.partition_id, mode, &self.ctx.processing),
            deps,
            self.logger.clone(),
        );
        let exporter = (mode == StreamProcessorMode::Processing).then(|| {
            ExporterDirector::spawn(
                &self.ctx.scheduler,
                ExporterDirectorConfig::new(self.ctx.partition_id, &self.ctx.exporters),
                raft.storage(),
                raft.subscribe_commit(),
                writer,
                state,
                self.logger.clone(),
            )
        });
        Ok(Runtime {
            mode,
            term,
            processor,
            exporter,
        })
    }
}

/// Lay out a fresh state store in `state_dir`: the latest snapshot if there
/// is one, empty otherwise, migrated to the current layout. Everything
/// else under `runtime_dir` is removed first.
fn prepare_state(
    runtime_dir: &Path,
    state_dir: &Path,
    store: &FileBasedSnapshotStore,
    logger: Logger,
) -> Result<StateDb, PartitionError> {
    fs::create_dir_all(runtime_dir)?;
    for entry in fs::read_dir(runtime_dir)? {
        let path = entry?.path();
        if let Err(e) = fs::remove_dir_all(&path) {
            warn!(logger, "Failed to remove stale state"; "path" => path.display(), "error" => %e);
        }
    }
    match store.latest() {
        Some(snapshot) => store.restore(&snapshot, state_dir)?,
        None => fs::create_dir_all(state_dir)?,
    }
    let state = StateDb::open(state_dir)?;
    let applied = DbMigrator::new(logger.clone()).run_migrations(&state)?;
    if !applied.is_empty() {
        info!(logger, "Migrated state"; "migrations" => ?applied);
    }
    Ok(state)
}

#[async_trait]
impl Actor for PartitionController {
    type Message = ControllerMessage;

    fn name(&self) -> String {
        format!("partition-controller-{}", self.ctx.partition_id)
    }

    async fn on_start(&mut self, ctl: &ActorControl<ControllerMessage>) -> HandlerResult {
        Self::listen(ctl, self.ctx.raft.subscribe_events());
        self.reconcile(ctl, false).await;
        Ok(())
    }

    async fn handle(&mut self, ctl: &ActorControl<ControllerMessage>, msg: ControllerMessage) -> HandlerResult {
        match msg {
            ControllerMessage::Event { event, events } => {
                match event {
                    Ok(RaftEvent::RoleChanged(_)) => self.reconcile(ctl, false).await,
                    Ok(RaftEvent::SnapshotInstalled(snapshot)) => {
                        info!(self.logger, "Snapshot installed from leader, rebuilding"; "snapshot" => &snapshot.id);
                        self.reconcile(ctl, true).await;
                    }
                    Ok(RaftEvent::Failed(reason)) => {
                        error!(self.logger, "Replica failed, stopping partition runtime"; "reason" => &reason);
                        self.failed = true;
                        self.teardown().await;
                        self.ctx.health.report(&self.component(), HealthStatus::Dead(reason));
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(self.logger, "Missed replica events, rebuilding"; "missed" => missed);
                        self.reconcile(ctl, true).await;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                }
                Self::listen(ctl, events);
            }
            ControllerMessage::Rebuild => self.reconcile(ctl, true).await,
        }
        Ok(())
    }

    async fn on_stop(&mut self) {
        self.teardown().await;
        if !self.failed {
            self.ctx.health.remove(&self.component());
        }
        info!(self.logger, "Partition controller stopped");
    }
}
