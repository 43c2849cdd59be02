//! Records: the unit of the replicated log
//!
//! A record is a command, an event or a command rejection for one value type.
//! Commands express intent ("create this instance"), events are facts that
//! appliers fold into state, rejections answer commands that could not be
//! executed.

pub mod key;
mod value;

pub use self::value::{
    CheckpointValue, CommandDistributionValue, DeploymentResource, DeploymentValue, ExporterValue,
    InstanceValue, JobValue, RecordValue, ResourceDeletionValue, TimerValue, VariableDocument,
    VariableValue,
};

use serde::{Deserialize, Serialize};

pub const RECORD_VERSION: u16 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Instance,
    Variable,
    Job,
    Timer,
    Deployment,
    ResourceDeletion,
    CommandDistribution,
    Exporter,
    Checkpoint,
}

/// Verb within a value type. Commands use the imperative, events the past tense.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Create,
    Created,
    Complete,
    Completed,
    Cancel,
    Canceled,
    Set,
    Updated,
    Fail,
    Failed,
    Trigger,
    Triggered,
    Delete,
    Deleted,
    Acknowledge,
    Acknowledged,
    Started,
    Distributing,
    Finished,
    UpdatePosition,
    PositionUpdated,
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionType {
    NotFound,
    InvalidState,
    AlreadyExists,
    InvalidArgument,
    ProcessingError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Assigned when the record is appended; -1 before.
    pub position: i64,
    /// Position of the command this record was written for; -1 for client commands.
    pub source_position: i64,
    pub key: i64,
    pub partition_id: u32,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    #[serde(default)]
    pub rejection_type: Option<RejectionType>,
    #[serde(default)]
    pub rejection_reason: String,
    /// Identifies the waiting client request; -1 when nobody waits.
    pub request_id: i64,
    pub request_stream_id: i32,
    /// Processing clock, epoch milliseconds.
    pub timestamp: i64,
    pub record_version: u16,
    pub value: RecordValue,
}

impl Record {
    /// A new command, not yet appended.
    pub fn command(key: i64, intent: Intent, value: RecordValue) -> Self {
        Self {
            position: key::NONE,
            source_position: key::NONE,
            key,
            partition_id: 0,
            record_type: RecordType::Command,
            value_type: value.value_type(),
            intent,
            rejection_type: None,
            rejection_reason: String::new(),
            request_id: -1,
            request_stream_id: -1,
            timestamp: -1,
            record_version: RECORD_VERSION,
            value,
        }
    }

    pub fn with_request(mut self, request_stream_id: i32, request_id: i64) -> Self {
        self.request_stream_id = request_stream_id;
        self.request_id = request_id;
        self
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }

    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }

    pub fn has_request(&self) -> bool {
        self.request_id >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_defaults() {
        let record = Record::command(
            -1,
            Intent::Create,
            RecordValue::Instance(InstanceValue {
                type_name: "Foo".into(),
                ..Default::default()
            }),
        );
        assert!(record.is_command());
        assert_eq!(record.value_type, ValueType::Instance);
        assert_eq!(record.position, -1);
        assert_eq!(record.source_position, -1);
        assert!(!record.has_request());
        assert!(record.with_request(1, 7).has_request());
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&(RecordType::CommandRejection, ValueType::CommandDistribution, Intent::UpdatePosition))
            .unwrap();
        assert_eq!(json, r#"["COMMAND_REJECTION","COMMAND_DISTRIBUTION","UPDATE_POSITION"]"#);
    }

    #[test]
    fn test_older_record_without_rejection_fields_deserializes() {
        let json = r#"{
            "position": 4, "source_position": -1, "key": 7, "partition_id": 1,
            "record_type": "EVENT", "value_type": "INSTANCE", "intent": "CREATED",
            "request_id": -1, "request_stream_id": -1, "timestamp": 0, "record_version": 1,
            "value": {"type": "Instance", "value": {"type_name": "Foo"}}
        }"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(record.rejection_type, None);
        assert_eq!(record.value, RecordValue::Instance(InstanceValue { type_name: "Foo".into(), ..Default::default() }));
    }
}
