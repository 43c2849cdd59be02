//! Command processors, one per `(ValueType, Intent)` command

use super::distribution::{self, acknowledge_to_origin, is_distributable};
use super::{ProcessingContext, ProcessingError, SideEffect};
use crate::protocol::{
    CheckpointValue, DeploymentValue, ExporterValue, InstanceValue, Intent, JobValue, RecordValue, RejectionType,
    ResourceDeletionValue, TimerValue, ValueType, VariableValue,
};
use crate::state::{
    CheckpointState, DeploymentState, ExporterPositionState, InstanceRecord, InstanceState, JobState, JobStatus,
    TimerState, VariableState,
};
use std::collections::HashSet;

pub(crate) fn process(ctx: &mut ProcessingContext<'_>) -> Result<(), ProcessingError> {
    let command = ctx.command();
    if ctx.is_distributed() && !is_distributable(command.value_type, command.intent) {
        ctx.reject(
            RejectionType::InvalidArgument,
            format!(
                "Expected key {} to belong to partition {}",
                command.key,
                ctx.partition_id()
            ),
        );
        return Ok(());
    }

    match (command.value_type, command.intent, &command.value) {
        (ValueType::Instance, Intent::Create, RecordValue::Instance(value)) => create_instance(ctx, value),
        (ValueType::Instance, Intent::Complete, RecordValue::Instance(_)) => {
            end_instance(ctx, Intent::Completed, "complete")
        }
        (ValueType::Instance, Intent::Cancel, RecordValue::Instance(_)) => end_instance(ctx, Intent::Canceled, "cancel"),

        (ValueType::Variable, Intent::Set, RecordValue::Variable(value)) => set_variable(ctx, value),

        (ValueType::Job, Intent::Create, RecordValue::Job(value)) => create_job(ctx, value),
        (ValueType::Job, Intent::Complete, RecordValue::Job(_)) => complete_job(ctx),
        (ValueType::Job, Intent::Fail, RecordValue::Job(value)) => fail_job(ctx, value),

        (ValueType::Timer, Intent::Create, RecordValue::Timer(value)) => create_timer(ctx, value),
        (ValueType::Timer, Intent::Trigger, RecordValue::Timer(_)) => end_timer(ctx, Intent::Triggered, "trigger"),
        (ValueType::Timer, Intent::Cancel, RecordValue::Timer(_)) => end_timer(ctx, Intent::Canceled, "cancel"),

        (ValueType::Deployment, Intent::Create, RecordValue::Deployment(value)) => create_deployment(ctx, value),
        (ValueType::ResourceDeletion, Intent::Delete, RecordValue::ResourceDeletion(value)) => {
            delete_resource(ctx, value)
        }

        (ValueType::CommandDistribution, Intent::Acknowledge, RecordValue::CommandDistribution(value)) => {
            distribution::process_acknowledge(ctx, value)
        }

        (ValueType::Exporter, Intent::UpdatePosition, RecordValue::Exporter(value)) => {
            update_exporter_position(ctx, value)
        }

        (ValueType::Checkpoint, Intent::Create, RecordValue::Checkpoint(value)) => create_checkpoint(ctx, value),

        (value_type, intent, _) => {
            ctx.reject(
                RejectionType::InvalidArgument,
                format!("{:?} does not support command {:?}", value_type, intent),
            );
            Ok(())
        }
    }
}

/// The instance at `key`, or a rejection when it does not exist or is no longer active.
fn active_instance(ctx: &mut ProcessingContext<'_>, key: i64, action: &str) -> Result<Option<InstanceRecord>, ProcessingError> {
    match InstanceState::get(ctx.state(), key)? {
        None => {
            ctx.reject(
                RejectionType::NotFound,
                format!("Expected to {} instance with key '{}', but no such instance was found", action, key),
            );
            Ok(None)
        }
        Some(instance) if !instance.is_active() => {
            ctx.reject(
                RejectionType::InvalidState,
                format!(
                    "Expected to {} instance with key '{}', but it is {:?}",
                    action, key, instance.status
                ),
            );
            Ok(None)
        }
        Some(instance) => Ok(Some(instance)),
    }
}

fn create_instance(ctx: &mut ProcessingContext<'_>, value: &InstanceValue) -> Result<(), ProcessingError> {
    if value.type_name.trim().is_empty() {
        ctx.reject(RejectionType::InvalidArgument, "Expected an instance type name, but it was empty");
        return Ok(());
    }
    let requested = ctx.command().key;
    let key = if requested >= 0 {
        if InstanceState::get(ctx.state(), requested)?.is_some() {
            ctx.reject(
                RejectionType::AlreadyExists,
                format!("Expected to create instance with key '{}', but it already exists", requested),
            );
            return Ok(());
        }
        requested
    } else {
        ctx.next_key()?
    };

    let created = ctx.append_event(key, Intent::Created, RecordValue::Instance(value.clone()))?;
    for (name, variable) in &value.variables {
        ctx.append_event(
            key,
            Intent::Created,
            RecordValue::Variable(VariableValue {
                scope_key: key,
                name: name.clone(),
                value: variable.clone(),
            }),
        )?;
    }
    ctx.respond_with(created);
    Ok(())
}

fn end_instance(ctx: &mut ProcessingContext<'_>, intent: Intent, action: &str) -> Result<(), ProcessingError> {
    let key = ctx.command().key;
    let Some(instance) = active_instance(ctx, key, action)? else {
        return Ok(());
    };

    for job in JobState::of_instance(ctx.state(), key)? {
        ctx.append_event(
            job.key,
            Intent::Canceled,
            RecordValue::Job(JobValue {
                instance_key: job.instance_key,
                job_type: job.job_type,
                retries: job.retries,
                error_message: job.error_message,
            }),
        )?;
    }
    for timer in TimerState::of_instance(ctx.state(), key)? {
        ctx.append_event(
            timer.key,
            Intent::Canceled,
            RecordValue::Timer(TimerValue {
                instance_key: timer.instance_key,
                due_date: timer.due_date,
            }),
        )?;
    }
    let variables = VariableState::document(ctx.state(), key)?;
    let index = ctx.append_event(
        key,
        intent,
        RecordValue::Instance(InstanceValue {
            type_name: instance.type_name,
            variables,
        }),
    )?;
    ctx.respond_with(index);
    Ok(())
}

fn set_variable(ctx: &mut ProcessingContext<'_>, value: &VariableValue) -> Result<(), ProcessingError> {
    if value.name.is_empty() {
        ctx.reject(RejectionType::InvalidArgument, "Expected a variable name, but it was empty");
        return Ok(());
    }
    if active_instance(ctx, value.scope_key, "set a variable on")?.is_none() {
        return Ok(());
    }
    let intent = match VariableState::get(ctx.state(), value.scope_key, &value.name)? {
        Some(current) if current == value.value => {
            ctx.reject(
                RejectionType::InvalidState,
                format!("Variable '{}' already has the given value", value.name),
            );
            return Ok(());
        }
        Some(_) => Intent::Updated,
        None => Intent::Created,
    };
    let index = ctx.append_event(value.scope_key, intent, RecordValue::Variable(value.clone()))?;
    ctx.respond_with(index);
    Ok(())
}

fn create_job(ctx: &mut ProcessingContext<'_>, value: &JobValue) -> Result<(), ProcessingError> {
    if value.job_type.is_empty() || value.retries <= 0 {
        ctx.reject(
            RejectionType::InvalidArgument,
            "Expected a job type and a positive number of retries",
        );
        return Ok(());
    }
    if active_instance(ctx, value.instance_key, "create a job for")?.is_none() {
        return Ok(());
    }
    let key = ctx.next_key()?;
    let index = ctx.append_event(
        key,
        Intent::Created,
        RecordValue::Job(JobValue {
            error_message: String::new(),
            ..value.clone()
        }),
    )?;
    ctx.respond_with(index);
    Ok(())
}

fn complete_job(ctx: &mut ProcessingContext<'_>) -> Result<(), ProcessingError> {
    let key = ctx.command().key;
    let Some(job) = JobState::get(ctx.state(), key)? else {
        ctx.reject(
            RejectionType::NotFound,
            format!("Expected to complete job with key '{}', but no such job was found", key),
        );
        return Ok(());
    };
    if job.status == JobStatus::Failed {
        ctx.reject(
            RejectionType::InvalidState,
            format!("Expected to complete job with key '{}', but it failed without retries", key),
        );
        return Ok(());
    }
    let index = ctx.append_event(
        key,
        Intent::Completed,
        RecordValue::Job(JobValue {
            instance_key: job.instance_key,
            job_type: job.job_type,
            retries: job.retries,
            error_message: String::new(),
        }),
    )?;
    ctx.respond_with(index);
    Ok(())
}

fn fail_job(ctx: &mut ProcessingContext<'_>, value: &JobValue) -> Result<(), ProcessingError> {
    let key = ctx.command().key;
    let Some(job) = JobState::get(ctx.state(), key)? else {
        ctx.reject(
            RejectionType::NotFound,
            format!("Expected to fail job with key '{}', but no such job was found", key),
        );
        return Ok(());
    };
    if job.status == JobStatus::Failed {
        ctx.reject(
            RejectionType::InvalidState,
            format!("Expected to fail job with key '{}', but it has no retries left", key),
        );
        return Ok(());
    }
    let index = ctx.append_event(
        key,
        Intent::Failed,
        RecordValue::Job(JobValue {
            instance_key: job.instance_key,
            job_type: job.job_type,
            retries: job.retries - 1,
            error_message: value.error_message.clone(),
        }),
    )?;
    ctx.respond_with(index);
    Ok(())
}

fn create_timer(ctx: &mut ProcessingContext<'_>, value: &TimerValue) -> Result<(), ProcessingError> {
    if active_instance(ctx, value.instance_key, "create a timer for")?.is_none() {
        return Ok(());
    }
    let key = ctx.next_key()?;
    let index = ctx.append_event(key, Intent::Created, RecordValue::Timer(value.clone()))?;
    ctx.side_effect(SideEffect::TimerScheduled {
        due_date: value.due_date,
    });
    ctx.respond_with(index);
    Ok(())
}

fn end_timer(ctx: &mut ProcessingContext<'_>, intent: Intent, action: &str) -> Result<(), ProcessingError> {
    let key = ctx.command().key;
    let Some(timer) = TimerState::get(ctx.state(), key)? else {
        ctx.reject(
            RejectionType::NotFound,
            format!("Expected to {} timer with key '{}', but no such timer was found", action, key),
        );
        return Ok(());
    };
    let index = ctx.append_event(
        key,
        intent,
        RecordValue::Timer(TimerValue {
            instance_key: timer.instance_key,
            due_date: timer.due_date,
        }),
    )?;
    ctx.respond_with(index);
    Ok(())
}

fn create_deployment(ctx: &mut ProcessingContext<'_>, value: &DeploymentValue) -> Result<(), ProcessingError> {
    if ctx.is_distributed() {
        let key = ctx.command().key;
        if DeploymentState::get(ctx.state(), key)?.is_none() {
            ctx.append_event(key, Intent::Created, RecordValue::Deployment(value.clone()))?;
        }
        acknowledge_to_origin(ctx);
        return Ok(());
    }

    if value.resources.is_empty() {
        ctx.reject(RejectionType::InvalidArgument, "Expected to deploy at least one resource");
        return Ok(());
    }
    let mut names = HashSet::new();
    for resource in &value.resources {
        if resource.name.is_empty() || !names.insert(resource.name.as_str()) {
            ctx.reject(
                RejectionType::InvalidArgument,
                format!("Expected unique, non-empty resource names, but got '{}'", resource.name),
            );
            return Ok(());
        }
    }

    let key = ctx.next_key()?;
    let index = ctx.append_event(key, Intent::Created, RecordValue::Deployment(value.clone()))?;
    ctx.respond_with(index);
    distribution::distribute(ctx, key, Intent::Create, RecordValue::Deployment(value.clone()))
}

fn delete_resource(ctx: &mut ProcessingContext<'_>, value: &ResourceDeletionValue) -> Result<(), ProcessingError> {
    let exists = DeploymentState::get(ctx.state(), value.resource_key)?.is_some();
    if ctx.is_distributed() {
        if exists {
            let key = ctx.command().key;
            ctx.append_event(key, Intent::Deleted, RecordValue::ResourceDeletion(value.clone()))?;
        }
        acknowledge_to_origin(ctx);
        return Ok(());
    }

    if !exists {
        ctx.reject(
            RejectionType::NotFound,
            format!(
                "Expected to delete resource with key '{}', but no such resource was found",
                value.resource_key
            ),
        );
        return Ok(());
    }
    let key = ctx.next_key()?;
    let index = ctx.append_event(key, Intent::Deleted, RecordValue::ResourceDeletion(value.clone()))?;
    ctx.respond_with(index);
    distribution::distribute(ctx, key, Intent::Delete, RecordValue::ResourceDeletion(value.clone()))
}

fn update_exporter_position(ctx: &mut ProcessingContext<'_>, value: &ExporterValue) -> Result<(), ProcessingError> {
    if let Some(current) = ExporterPositionState::get(ctx.state(), &value.exporter_id)? {
        if current >= value.position {
            ctx.reject(
                RejectionType::InvalidState,
                format!(
                    "Expected exporter '{}' position to move past {}, but got {}",
                    value.exporter_id, current, value.position
                ),
            );
            return Ok(());
        }
    }
    let key = ctx.command().key;
    let index = ctx.append_event(key, Intent::PositionUpdated, RecordValue::Exporter(value.clone()))?;
    ctx.respond_with(index);
    Ok(())
}

fn create_checkpoint(ctx: &mut ProcessingContext<'_>, value: &CheckpointValue) -> Result<(), ProcessingError> {
    let command = ctx.command();
    let latest = CheckpointState::latest(ctx.state())?;
    let (intent, checkpoint_position) = match latest {
        Some(latest) if latest.checkpoint_id >= value.checkpoint_id => (Intent::Ignored, latest.checkpoint_position),
        _ => (Intent::Created, command.position),
    };
    let index = ctx.append_event(
        command.key,
        intent,
        RecordValue::Checkpoint(CheckpointValue {
            checkpoint_id: value.checkpoint_id,
            checkpoint_position,
        }),
    )?;
    ctx.respond_with(index);
    Ok(())
}
