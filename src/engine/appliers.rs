//! Event appliers: pure functions of (event, state)

use super::ProcessingError;
use crate::protocol::{Intent, Record, RecordValue, ValueType};
use crate::state::{
    CheckpointInfo, CheckpointState, DeploymentRecord, DeploymentState, DistributionRecord, DistributionState,
    ExporterPositionState, InstanceRecord, InstanceState, InstanceStatus, JobRecord, JobState, JobStatus,
    KeyGenerator, TimerRecord, TimerState, Transaction, VariableState,
};

pub(crate) fn apply(txn: &mut Transaction, partition_id: u32, event: &Record) -> Result<(), ProcessingError> {
    KeyGenerator::new(partition_id).set_key_if_higher(txn, event.key)?;

    match (event.value_type, event.intent, &event.value) {
        (ValueType::Instance, Intent::Created, RecordValue::Instance(value)) => {
            InstanceState::put(
                txn,
                &InstanceRecord {
                    key: event.key,
                    type_name: value.type_name.clone(),
                    status: InstanceStatus::Active,
                },
            )?;
        }
        (ValueType::Instance, Intent::Completed, RecordValue::Instance(_)) => {
            InstanceState::set_status(txn, event.key, InstanceStatus::Completed)?;
            VariableState::remove_scope(txn, event.key)?;
        }
        (ValueType::Instance, Intent::Canceled, RecordValue::Instance(_)) => {
            InstanceState::set_status(txn, event.key, InstanceStatus::Canceled)?;
            VariableState::remove_scope(txn, event.key)?;
        }

        (ValueType::Variable, Intent::Created | Intent::Updated, RecordValue::Variable(value)) => {
            VariableState::set(txn, value.scope_key, &value.name, &value.value)?;
        }

        (ValueType::Job, Intent::Created, RecordValue::Job(value)) => {
            JobState::put(
                txn,
                &JobRecord {
                    key: event.key,
                    instance_key: value.instance_key,
                    job_type: value.job_type.clone(),
                    retries: value.retries,
                    status: JobStatus::Activatable,
                    error_message: String::new(),
                },
            )?;
        }
        (ValueType::Job, Intent::Failed, RecordValue::Job(value)) => {
            let status = if value.retries > 0 {
                JobStatus::Activatable
            } else {
                JobStatus::Failed
            };
            JobState::put(
                txn,
                &JobRecord {
                    key: event.key,
                    instance_key: value.instance_key,
                    job_type: value.job_type.clone(),
                    retries: value.retries,
                    status,
                    error_message: value.error_message.clone(),
                },
            )?;
        }
        (ValueType::Job, Intent::Completed | Intent::Canceled, RecordValue::Job(_)) => {
            JobState::remove(txn, event.key);
        }

        (ValueType::Timer, Intent::Created, RecordValue::Timer(value)) => {
            TimerState::put(
                txn,
                &TimerRecord {
                    key: event.key,
                    instance_key: value.instance_key,
                    due_date: value.due_date,
                },
            )?;
        }
        (ValueType::Timer, Intent::Triggered | Intent::Canceled, RecordValue::Timer(value)) => {
            TimerState::remove(
                txn,
                &TimerRecord {
                    key: event.key,
                    instance_key: value.instance_key,
                    due_date: value.due_date,
                },
            );
        }

        (ValueType::Deployment, Intent::Created, RecordValue::Deployment(value)) => {
            DeploymentState::put(
                txn,
                &DeploymentRecord {
                    key: event.key,
                    resources: value.resources.clone(),
                },
            )?;
        }
        (ValueType::ResourceDeletion, Intent::Deleted, RecordValue::ResourceDeletion(value)) => {
            DeploymentState::remove(txn, value.resource_key);
        }

        (ValueType::CommandDistribution, Intent::Started, RecordValue::CommandDistribution(value)) => {
            let command_value = value
                .command_value
                .as_deref()
                .cloned()
                .ok_or(ProcessingError::ValueMismatch(ValueType::CommandDistribution))?;
            DistributionState::start(
                txn,
                &DistributionRecord {
                    key: event.key,
                    value_type: value.value_type,
                    intent: value.intent,
                    command_value,
                },
            )?;
        }
        (ValueType::CommandDistribution, Intent::Distributing, RecordValue::CommandDistribution(value)) => {
            DistributionState::add_pending(txn, event.key, value.partition_id);
        }
        (ValueType::CommandDistribution, Intent::Acknowledged, RecordValue::CommandDistribution(value)) => {
            DistributionState::remove_pending(txn, event.key, value.partition_id);
        }
        (ValueType::CommandDistribution, Intent::Finished, RecordValue::CommandDistribution(_)) => {
            DistributionState::finish(txn, event.key);
        }

        (ValueType::Exporter, Intent::PositionUpdated, RecordValue::Exporter(value)) => {
            ExporterPositionState::update(txn, &value.exporter_id, value.position)?;
        }

        (ValueType::Checkpoint, Intent::Created, RecordValue::Checkpoint(value)) => {
            CheckpointState::set_latest(
                txn,
                &CheckpointInfo {
                    checkpoint_id: value.checkpoint_id,
                    checkpoint_position: value.checkpoint_position,
                },
            )?;
        }
        (ValueType::Checkpoint, Intent::Ignored, RecordValue::Checkpoint(_)) => {}

        (value_type, _, value) if value.value_type() != value_type => {
            return Err(ProcessingError::ValueMismatch(value_type));
        }
        (value_type, intent, _) => return Err(ProcessingError::UnknownEvent { value_type, intent }),
    }
    Ok(())
}
