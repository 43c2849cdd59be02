//! Command distribution across partitions
//!
//! Cluster-wide commands (deployments, resource deletions) are processed on
//! the partition that received them and then sent to every other partition.
//! The origin tracks one pending entry per target partition in its state and
//! finishes the distribution once every target acknowledged. Everything the
//! origin knows about a distribution lives in the log, so a new leader
//! resumes re-delivery from its state alone.

use super::{ProcessingContext, ProcessingError, SideEffect};
use crate::actor::RetryStrategy;
use crate::protocol::{CommandDistributionValue, Intent, Record, RecordValue, RejectionType, ValueType};
use crate::state::{DistributionState, StateError, StateRead};
use std::collections::HashMap;
use std::time::Duration;

/// Delivers commands to other partitions. Delivery is best effort; the
/// redistributor covers losses.
pub trait InterPartitionCommandSender: Send + Sync {
    fn send_command(&self, receiver_partition_id: u32, command: Record);
}

/// Write the distribution events for a command processed on its origin
/// partition and send it to the other partitions after commit.
pub(crate) fn distribute(
    ctx: &mut ProcessingContext<'_>,
    distribution_key: i64,
    intent: Intent,
    value: RecordValue,
) -> Result<(), ProcessingError> {
    let targets = ctx.other_partitions();
    if targets.is_empty() {
        return Ok(());
    }
    let value_type = value.value_type();
    ctx.append_event(
        distribution_key,
        Intent::Started,
        RecordValue::CommandDistribution(CommandDistributionValue {
            partition_id: ctx.partition_id(),
            value_type,
            intent,
            command_value: Some(Box::new(value.clone())),
        }),
    )?;
    for partition_id in targets {
        ctx.append_event(
            distribution_key,
            Intent::Distributing,
            RecordValue::CommandDistribution(CommandDistributionValue {
                partition_id,
                value_type,
                intent,
                command_value: None,
            }),
        )?;
        ctx.side_effect(SideEffect::SendCommand {
            partition_id,
            command: Record::command(distribution_key, intent, value.clone()),
        });
    }
    Ok(())
}

/// On a target partition: tell the origin that the distributed command was processed.
pub(crate) fn acknowledge_to_origin(ctx: &mut ProcessingContext<'_>) {
    let command = ctx.command();
    let origin = crate::protocol::key::decode_partition_id(command.key);
    let ack = Record::command(
        command.key,
        Intent::Acknowledge,
        RecordValue::CommandDistribution(CommandDistributionValue {
            partition_id: ctx.partition_id(),
            value_type: command.value_type,
            intent: command.intent,
            command_value: None,
        }),
    );
    ctx.side_effect(SideEffect::SendCommand {
        partition_id: origin,
        command: ack,
    });
}

/// `COMMAND_DISTRIBUTION:ACKNOWLEDGE` on the origin partition.
pub(crate) fn process_acknowledge(
    ctx: &mut ProcessingContext<'_>,
    value: &CommandDistributionValue,
) -> Result<(), ProcessingError> {
    let key = ctx.command().key;
    if !DistributionState::is_pending(ctx.state(), key, value.partition_id)? {
        ctx.reject(
            RejectionType::NotFound,
            format!(
                "Expected to acknowledge distribution {} for partition {}, but it is not pending",
                key, value.partition_id
            ),
        );
        return Ok(());
    }
    ctx.append_event(key, Intent::Acknowledged, RecordValue::CommandDistribution(value.clone()))?;
    if DistributionState::pending_partitions(ctx.state(), key)?.is_empty() {
        let index = ctx.append_event(
            key,
            Intent::Finished,
            RecordValue::CommandDistribution(CommandDistributionValue {
                partition_id: ctx.partition_id(),
                value_type: value.value_type,
                intent: value.intent,
                command_value: None,
            }),
        )?;
        ctx.respond_with(index);
    }
    Ok(())
}

/// Outcome of one redistribution round.
#[derive(Debug, Default, PartialEq)]
pub struct RedistributionRound {
    /// Commands to send again, with their target partition.
    pub resend: Vec<(u32, Record)>,
    /// Acknowledgements to append to the local log for targets that left the topology.
    pub dropped: Vec<Record>,
}

/// Retries pending distributions on the leader with exponential backoff.
pub struct CommandRedistributor {
    initial: Duration,
    max: Duration,
    retries: HashMap<(i64, u32), (i64, RetryStrategy)>,
}

impl CommandRedistributor {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            retries: HashMap::new(),
        }
    }

    /// Decide which pending distributions to resend at `now` (epoch millis).
    ///
    /// A distribution seen for the first time waits one initial interval,
    /// since it was just sent by its processor or a previous leader.
    pub fn run_retry_cycle<R: StateRead>(
        &mut self,
        state: &R,
        now: i64,
        partition_ids: &[u32],
    ) -> Result<RedistributionRound, StateError> {
        let pending = DistributionState::all_pending(state)?;
        self.retries.retain(|entry, _| pending.contains(entry));

        let mut round = RedistributionRound::default();
        for (key, partition_id) in pending {
            let Some(distribution) = DistributionState::get(state, key)? else {
                continue;
            };
            if !partition_ids.contains(&partition_id) {
                self.retries.remove(&(key, partition_id));
                round.dropped.push(Record::command(
                    key,
                    Intent::Acknowledge,
                    RecordValue::CommandDistribution(CommandDistributionValue {
                        partition_id,
                        value_type: distribution.value_type,
                        intent: distribution.intent,
                        command_value: None,
                    }),
                ));
                continue;
            }

            let (initial, max) = (self.initial, self.max);
            let (next_at, retry) = self.retries.entry((key, partition_id)).or_insert_with(|| {
                let mut retry = RetryStrategy::new(initial, max);
                let first = now + retry.next_delay().as_millis() as i64;
                (first, retry)
            });
            if *next_at > now {
                continue;
            }
            *next_at = now + retry.next_delay().as_millis() as i64;
            round.resend.push((
                partition_id,
                Record::command(key, distribution.intent, distribution.command_value.clone()),
            ));
        }
        Ok(round)
    }

    pub fn tracked(&self) -> usize {
        self.retries.len()
    }
}

pub(crate) fn is_distributable(value_type: ValueType, intent: Intent) -> bool {
    matches!(
        (value_type, intent),
        (ValueType::Deployment, Intent::Create) | (ValueType::ResourceDeletion, Intent::Delete)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeploymentValue;
    use crate::state::{DistributionRecord, StateDb};

    fn store_with_pending(targets: &[u32]) -> (tempfile::TempDir, StateDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let mut txn = db.begin();
        DistributionState::start(
            &mut txn,
            &DistributionRecord {
                key: 42,
                value_type: ValueType::Deployment,
                intent: Intent::Create,
                command_value: RecordValue::Deployment(DeploymentValue::default()),
            },
        )
        .unwrap();
        for target in targets {
            DistributionState::add_pending(&mut txn, 42, *target);
        }
        txn.commit().unwrap();
        (dir, db)
    }

    #[test]
    fn test_retries_back_off() {
        let (_dir, db) = store_with_pending(&[2]);
        let mut redistributor = CommandRedistributor::new(Duration::from_millis(1_000), Duration::from_millis(4_000));

        assert!(redistributor.run_retry_cycle(&db, 0, &[1, 2]).unwrap().resend.is_empty());
        assert_eq!(redistributor.tracked(), 1);
        assert!(redistributor.run_retry_cycle(&db, 500, &[1, 2]).unwrap().resend.is_empty());

        let round = redistributor.run_retry_cycle(&db, 1_200, &[1, 2]).unwrap();
        assert_eq!(round.resend.len(), 1);
        assert_eq!(round.resend[0].0, 2);
        assert_eq!(round.resend[0].1.key, 42);
        assert_eq!(round.resend[0].1.intent, Intent::Create);

        // second delay is about 2s
        assert!(redistributor.run_retry_cycle(&db, 2_500, &[1, 2]).unwrap().resend.is_empty());
        assert_eq!(redistributor.run_retry_cycle(&db, 3_500, &[1, 2]).unwrap().resend.len(), 1);
    }

    #[test]
    fn test_removed_partition_is_dropped() {
        let (_dir, db) = store_with_pending(&[2, 3]);
        let mut redistributor = CommandRedistributor::new(Duration::from_millis(1_000), Duration::from_millis(4_000));
        let round = redistributor.run_retry_cycle(&db, 0, &[1, 2]).unwrap();
        assert_eq!(round.dropped.len(), 1);
        assert_eq!(round.dropped[0].intent, Intent::Acknowledge);
        assert_eq!(
            round.dropped[0].value,
            RecordValue::CommandDistribution(CommandDistributionValue {
                partition_id: 3,
                value_type: ValueType::Deployment,
                intent: Intent::Create,
                command_value: None,
            })
        );
    }

    #[test]
    fn test_acknowledged_entries_are_forgotten() {
        let (_dir, db) = store_with_pending(&[2]);
        let mut redistributor = CommandRedistributor::new(Duration::from_millis(1_000), Duration::from_millis(4_000));
        redistributor.run_retry_cycle(&db, 0, &[1, 2]).unwrap();

        let mut txn = db.begin();
        DistributionState::remove_pending(&mut txn, 42, 2);
        txn.commit().unwrap();
        redistributor.run_retry_cycle(&db, 5_000, &[1, 2]).unwrap();
        assert_eq!(redistributor.tracked(), 0);
    }
}
