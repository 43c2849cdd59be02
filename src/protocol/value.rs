//! Typed record values, one per value type

use super::{Intent, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Variables keyed by name.
pub type VariableDocument = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceValue {
    pub type_name: String,
    /// Initial variables, written as `VARIABLE:CREATED` events on creation.
    #[serde(default)]
    pub variables: VariableDocument,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    /// Key of the instance the variable belongs to.
    pub scope_key: i64,
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobValue {
    pub instance_key: i64,
    pub job_type: String,
    pub retries: i32,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerValue {
    pub instance_key: i64,
    /// Epoch milliseconds.
    pub due_date: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentResource {
    pub name: String,
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentValue {
    pub resources: Vec<DeploymentResource>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDeletionValue {
    /// Key of the deployment to delete.
    pub resource_key: i64,
}

/// Tracks one distributed command towards one partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandDistributionValue {
    pub partition_id: u32,
    pub value_type: ValueType,
    pub intent: Intent,
    /// The distributed command's value, carried on `STARTED`.
    #[serde(default)]
    pub command_value: Option<Box<RecordValue>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterValue {
    pub exporter_id: String,
    pub position: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointValue {
    pub checkpoint_id: i64,
    #[serde(default = "none")]
    pub checkpoint_position: i64,
}

fn none() -> i64 {
    -1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum RecordValue {
    Instance(InstanceValue),
    Variable(VariableValue),
    Job(JobValue),
    Timer(TimerValue),
    Deployment(DeploymentValue),
    ResourceDeletion(ResourceDeletionValue),
    CommandDistribution(CommandDistributionValue),
    Exporter(ExporterValue),
    Checkpoint(CheckpointValue),
}

impl RecordValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            RecordValue::Instance(_) => ValueType::Instance,
            RecordValue::Variable(_) => ValueType::Variable,
            RecordValue::Job(_) => ValueType::Job,
            RecordValue::Timer(_) => ValueType::Timer,
            RecordValue::Deployment(_) => ValueType::Deployment,
            RecordValue::ResourceDeletion(_) => ValueType::ResourceDeletion,
            RecordValue::CommandDistribution(_) => ValueType::CommandDistribution,
            RecordValue::Exporter(_) => ValueType::Exporter,
            RecordValue::Checkpoint(_) => ValueType::Checkpoint,
        }
    }
}
