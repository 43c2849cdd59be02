use super::ExporterError;
use crate::actor::{Actor, ActorControl, ActorRef, ActorScheduler, HandlerResult, TimerHandle};
use crate::config::ExporterConfig;
use crate::logstream::{LogAppender, LogStreamError, LogStreamReader};
use crate::protocol::{ExporterValue, Intent, Record, RecordValue};
use crate::raft::entry::AppendResult;
use crate::raft::node::CommitWatermark;
use crate::raft::storage::LogStorage;
use crate::state::{ExporterPositionState, StateDb};
use async_trait::async_trait;
use slog::{debug, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

const MAILBOX_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct ExporterDirectorConfig {
    pub partition_id: u32,
    pub exporter_ids: Vec<String>,
    pub flush_interval: Duration,
}

impl ExporterDirectorConfig {
    pub fn new(partition_id: u32, exporters: &ExporterConfig) -> Self {
        Self {
            partition_id,
            exporter_ids: exporters.ids.clone(),
            flush_interval: Duration::from_millis(exporters.flush_interval_ms),
        }
    }
}

pub enum ExporterMessage {
    Poll {
        exporter_id: String,
        max: usize,
        reply: oneshot::Sender<Result<Vec<Record>, ExporterError>>,
    },
    Acknowledge {
        exporter_id: String,
        position: i64,
        reply: oneshot::Sender<Result<(), ExporterError>>,
    },
    Positions(oneshot::Sender<BTreeMap<String, i64>>),
    Flush,
    Flushed {
        positions: Vec<(String, i64)>,
        result: Result<AppendResult, LogStreamError>,
    },
}

struct ExporterCursor {
    acknowledged: i64,
    /// Position of the last record handed out; differs from `acknowledged`
    /// while the exporter has unacknowledged records.
    read: i64,
    reader: LogStreamReader,
}

/// Serves exporters on the partition leader.
pub struct ExporterDirector {
    config: ExporterDirectorConfig,
    storage: Arc<dyn LogStorage>,
    commit: watch::Receiver<CommitWatermark>,
    writer: Arc<dyn LogAppender>,
    state: StateDb,
    cursors: BTreeMap<String, ExporterCursor>,
    /// Exporters whose acknowledged position is not yet in the log.
    dirty: BTreeSet<String>,
    flushing: bool,
    flush_timer: Option<TimerHandle>,
    logger: Logger,
}

impl ExporterDirector {
    pub fn spawn(
        scheduler: &ActorScheduler,
        config: ExporterDirectorConfig,
        storage: Arc<dyn LogStorage>,
        commit: watch::Receiver<CommitWatermark>,
        writer: Arc<dyn LogAppender>,
        state: StateDb,
        logger: Logger,
    ) -> ExporterFeed {
        let logger = logger.new(o!("partition" => config.partition_id));
        let director = ExporterDirector {
            config,
            storage,
            commit,
            writer,
            state,
            cursors: BTreeMap::new(),
            dirty: BTreeSet::new(),
            flushing: false,
            flush_timer: None,
            logger,
        };
        ExporterFeed {
            actor: scheduler.spawn(director, MAILBOX_CAPACITY),
        }
    }

    fn cursor(&mut self, exporter_id: &str) -> Result<&mut ExporterCursor, ExporterError> {
        self.cursors
            .get_mut(exporter_id)
            .ok_or_else(|| ExporterError::UnknownExporter(exporter_id.to_string()))
    }

    fn poll(&mut self, exporter_id: &str, max: usize) -> Result<Vec<Record>, ExporterError> {
        let cursor = self.cursor(exporter_id)?;
        if cursor.read != cursor.acknowledged {
            cursor.reader.seek_after(cursor.acknowledged)?;
            cursor.read = cursor.acknowledged;
        }
        let records = cursor.reader.read_batch(max)?;
        if let Some(last) = records.last() {
            cursor.read = last.position;
        }
        Ok(records)
    }

    fn acknowledge(&mut self, exporter_id: &str, position: i64) -> Result<(), ExporterError> {
        let commit_position = self.commit.borrow().position;
        if position > commit_position {
            return Err(ExporterError::BeyondCommit {
                position,
                commit_position,
            });
        }
        let cursor = self.cursor(exporter_id)?;
        if position <= cursor.acknowledged {
            return Ok(());
        }
        cursor.acknowledged = position;
        if cursor.read < position {
            cursor.read = -1;
        }
        self.dirty.insert(exporter_id.to_string());
        Ok(())
    }

    fn flush(&mut self, ctl: &ActorControl<ExporterMessage>) {
        if self.flushing || self.dirty.is_empty() {
            return;
        }
        let positions: Vec<(String, i64)> = self
            .dirty
            .iter()
            .filter_map(|id| self.cursors.get(id).map(|c| (id.clone(), c.acknowledged)))
            .collect();
        self.dirty.clear();
        let commands = positions
            .iter()
            .map(|(exporter_id, position)| {
                Record::command(
                    -1,
                    Intent::UpdatePosition,
                    RecordValue::Exporter(ExporterValue {
                        exporter_id: exporter_id.clone(),
                        position: *position,
                    }),
                )
            })
            .collect();
        self.flushing = true;
        let writer = self.writer.clone();
        ctl.run_on_completion(async move { writer.append(commands).await }, move |result| {
            ExporterMessage::Flushed { positions, result }
        });
    }
}

#[async_trait]
impl Actor for ExporterDirector {
    type Message = ExporterMessage;

    fn name(&self) -> String {
        format!("exporter-director-{}", self.config.partition_id)
    }

    async fn on_start(&mut self, ctl: &ActorControl<ExporterMessage>) -> HandlerResult {
        for exporter_id in self.config.exporter_ids.clone() {
            let acknowledged = ExporterPositionState::get(&self.state, &exporter_id)?.unwrap_or(-1);
            let mut reader = LogStreamReader::new(self.storage.clone(), self.commit.clone());
            if let Err(e) = reader.seek_after(acknowledged) {
                warn!(self.logger, "Exporter position was compacted"; "exporter" => &exporter_id, "error" => %e);
            }
            self.cursors.insert(
                exporter_id,
                ExporterCursor {
                    acknowledged,
                    read: acknowledged,
                    reader,
                },
            );
        }
        info!(self.logger, "Exporter director started"; "exporters" => self.cursors.len());
        self.flush_timer = Some(ctl.run_at_fixed_rate(self.config.flush_interval, || ExporterMessage::Flush));
        Ok(())
    }

    async fn handle(&mut self, ctl: &ActorControl<ExporterMessage>, msg: ExporterMessage) -> HandlerResult {
        match msg {
            ExporterMessage::Poll { exporter_id, max, reply } => {
                let _ = reply.send(self.poll(&exporter_id, max));
            }
            ExporterMessage::Acknowledge {
                exporter_id,
                position,
                reply,
            } => {
                let _ = reply.send(self.acknowledge(&exporter_id, position));
            }
            ExporterMessage::Positions(reply) => {
                let positions = self
                    .cursors
                    .iter()
                    .map(|(id, cursor)| (id.clone(), cursor.acknowledged))
                    .collect();
                let _ = reply.send(positions);
            }
            ExporterMessage::Flush => self.flush(ctl),
            ExporterMessage::Flushed { positions, result } => {
                self.flushing = false;
                match result {
                    Ok(appended) => {
                        debug!(self.logger, "Persisted exporter positions";
                            "count" => positions.len(), "position" => appended.highest_position);
                    }
                    Err(e) => {
                        warn!(self.logger, "Failed to persist exporter positions"; "error" => %e);
                        self.dirty.extend(positions.into_iter().map(|(id, _)| id));
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_stop(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.cancel();
        }
        if !self.dirty.is_empty() {
            debug!(self.logger, "Exporter director stopped with unflushed positions"; "count" => self.dirty.len());
        }
    }
}

/// Pull interface for exporters of one partition.
#[derive(Clone)]
pub struct ExporterFeed {
    actor: ActorRef<ExporterMessage>,
}

impl ExporterFeed {
    /// Up to `max` committed records after the exporter's acknowledged position.
    pub async fn poll(&self, exporter_id: &str, max: usize) -> Result<Vec<Record>, ExporterError> {
        let exporter_id = exporter_id.to_string();
        self.actor
            .ask(|reply| ExporterMessage::Poll { exporter_id, max, reply })
            .await?
    }

    pub async fn acknowledge(&self, exporter_id: &str, position: i64) -> Result<(), ExporterError> {
        let exporter_id = exporter_id.to_string();
        self.actor
            .ask(|reply| ExporterMessage::Acknowledge {
                exporter_id,
                position,
                reply,
            })
            .await?
    }

    /// Acknowledged positions, including those not yet persisted.
    pub async fn positions(&self) -> Result<BTreeMap<String, i64>, ExporterError> {
        Ok(self.actor.ask(ExporterMessage::Positions).await?)
    }

    /// Persist acknowledged positions now instead of waiting for the next flush.
    pub async fn flush(&self) -> Result<(), ExporterError> {
        Ok(self.actor.tell(ExporterMessage::Flush).await?)
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
    use crate::logging::test_logger;
    use crate::logstream::encode_batch;
    use crate::protocol::InstanceValue;
    use crate::raft::entry::{Configuration, EntryPayload, LogEntry};
    use crate::raft::storage::MemLogStorage;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured(Mutex<Vec<Record>>);

    #[async_trait]
    impl LogAppender for Captured {
        async fn append(&self, records: Vec<Record>) -> Result<AppendResult, LogStreamError> {
            let count = records.len() as i64;
            self.0.lock().unwrap().extend(records);
            Ok(AppendResult {
                index: 1,
                lowest_position: 100,
                highest_position: 100 + count - 1,
            })
        }
    }

    fn log_with_records(count: i64) -> (Arc<MemLogStorage>, watch::Sender<CommitWatermark>) {
        let storage = Arc::new(MemLogStorage::new(Configuration::new([1])));
        for position in 1..=count {
            let record = Record::command(
                -1,
                Intent::Create,
                RecordValue::Instance(InstanceValue {
                    type_name: format!("t{}", position),
                    ..Default::default()
                }),
            );
            storage
                .append(&[LogEntry {
                    index: position as u64,
                    term: 1,
                    payload: EntryPayload::Application {
                        lowest_position: position,
                        highest_position: position,
                        data: encode_batch(&[record]).unwrap(),
                    },
                }])
                .unwrap();
        }
        let (commit, _) = watch::channel(CommitWatermark {
            index: count as u64,
            position: count,
        });
        (storage, commit)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_acknowledge_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDb::open(dir.path()).unwrap();
        let (storage, commit) = log_with_records(5);
        let writer = Arc::new(Captured::default());
        let feed = ExporterDirector::spawn(
            &ActorScheduler::current(test_logger()),
            ExporterDirectorConfig {
                partition_id: 1,
                exporter_ids: vec!["elastic".into()],
                flush_interval: Duration::from_secs(3600),
            },
            storage,
            commit.subscribe(),
            writer.clone(),
            state,
            test_logger(),
        );

        let first = feed.poll("elastic", 3).await.unwrap();
        assert_eq!(first.iter().map(|r| r.position).collect::<Vec<_>>(), vec![1, 2, 3]);
        // unacknowledged records are delivered again
        let again = feed.poll("elastic", 2).await.unwrap();
        assert_eq!(again.iter().map(|r| r.position).collect::<Vec<_>>(), vec![1, 2]);

        feed.acknowledge("elastic", 2).await.unwrap();
        let next = feed.poll("elastic", 10).await.unwrap();
        assert_eq!(next.iter().map(|r| r.position).collect::<Vec<_>>(), vec![3, 4, 5]);

        assert!(matches!(
            feed.acknowledge("elastic", 9).await,
            Err(ExporterError::BeyondCommit { .. })
        ));
        assert!(matches!(
            feed.poll("unknown", 1).await,
            Err(ExporterError::UnknownExporter(_))
        ));

        feed.flush().await.unwrap();
        for _ in 0..100 {
            if !writer.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let written = writer.0.lock().unwrap().clone();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].intent, Intent::UpdatePosition);
        assert_eq!(
            written[0].value,
            RecordValue::Exporter(ExporterValue {
                exporter_id: "elastic".into(),
                position: 2,
            })
        );
        assert_eq!(feed.positions().await.unwrap().get("elastic"), Some(&2));
        feed.stop().await;
    }
}
