use super::{long_key, Keyspace, StateError, StateRead, Transaction};
use crate::protocol::{DeploymentResource, Intent, RecordValue, ValueType};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub key: i64,
    pub resources: Vec<DeploymentResource>,
}

pub struct DeploymentState;

impl DeploymentState {
    pub fn get<R: StateRead>(state: &R, key: i64) -> Result<Option<DeploymentRecord>, StateError> {
        state.get_value(Keyspace::Deployments, &long_key(key))
    }

    pub fn put(txn: &mut Transaction, deployment: &DeploymentRecord) -> Result<(), StateError> {
        txn.put(Keyspace::Deployments, &long_key(deployment.key), deployment)
    }

    pub fn remove(txn: &mut Transaction, key: i64) {
        txn.delete(Keyspace::Deployments, &long_key(key));
    }

    pub fn all<R: StateRead>(state: &R) -> Result<Vec<DeploymentRecord>, StateError> {
        state.scan_values(Keyspace::Deployments, &[])
    }
}

/// A command being distributed from this partition to the others.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistributionRecord {
    pub key: i64,
    pub value_type: ValueType,
    pub intent: Intent,
    pub command_value: RecordValue,
}

/// Started distributions and, per target partition, the ones not yet acknowledged.
pub struct DistributionState;

impl DistributionState {
    fn pending_key(distribution_key: i64, partition_id: u32) -> Vec<u8> {
        let mut key = long_key(distribution_key).to_vec();
        key.extend_from_slice(&partition_id.to_be_bytes());
        key
    }

    fn decode_pending_key(key: &[u8]) -> Result<(i64, u32), StateError> {
        if key.len() != 12 {
            return Err(StateError::Corrupted(format!(
                "pending distribution key has {} bytes",
                key.len()
            )));
        }
        let distribution_key = super::read_long(&key[..8])?;
        let mut partition = [0u8; 4];
        partition.copy_from_slice(&key[8..]);
        Ok((distribution_key, u32::from_be_bytes(partition)))
    }

    pub fn get<R: StateRead>(state: &R, key: i64) -> Result<Option<DistributionRecord>, StateError> {
        state.get_value(Keyspace::Distributions, &long_key(key))
    }

    pub fn start(txn: &mut Transaction, record: &DistributionRecord) -> Result<(), StateError> {
        txn.put(Keyspace::Distributions, &long_key(record.key), record)
    }

    pub fn finish(txn: &mut Transaction, key: i64) {
        txn.delete(Keyspace::Distributions, &long_key(key));
    }

    pub fn add_pending(txn: &mut Transaction, key: i64, partition_id: u32) {
        txn.put_raw(Keyspace::PendingDistributions, &Self::pending_key(key, partition_id), Vec::new());
    }

    pub fn remove_pending(txn: &mut Transaction, key: i64, partition_id: u32) {
        txn.delete(Keyspace::PendingDistributions, &Self::pending_key(key, partition_id));
    }

    pub fn is_pending<R: StateRead>(state: &R, key: i64, partition_id: u32) -> Result<bool, StateError> {
        state.exists(Keyspace::PendingDistributions, &Self::pending_key(key, partition_id))
    }

    pub fn pending_partitions<R: StateRead>(state: &R, key: i64) -> Result<Vec<u32>, StateError> {
        state
            .scan_raw(Keyspace::PendingDistributions, &long_key(key))?
            .iter()
            .map(|(k, _)| Self::decode_pending_key(k).map(|(_, partition)| partition))
            .collect()
    }

    /// Every pending `(distribution key, partition)` pair.
    pub fn all_pending<R: StateRead>(state: &R) -> Result<Vec<(i64, u32)>, StateError> {
        state
            .scan_raw(Keyspace::PendingDistributions, &[])?
            .iter()
            .map(|(k, _)| Self::decode_pending_key(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeploymentValue;
    use crate::state::StateDb;

    #[test]
    fn test_pending_distribution_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let mut txn = db.begin();
        DistributionState::start(
            &mut txn,
            &DistributionRecord {
                key: 5,
                value_type: ValueType::Deployment,
                intent: Intent::Create,
                command_value: RecordValue::Deployment(DeploymentValue::default()),
            },
        )
        .unwrap();
        DistributionState::add_pending(&mut txn, 5, 2);
        DistributionState::add_pending(&mut txn, 5, 3);
        DistributionState::add_pending(&mut txn, 6, 2);
        txn.commit().unwrap();

        assert_eq!(DistributionState::pending_partitions(&db, 5).unwrap(), vec![2, 3]);
        assert!(DistributionState::is_pending(&db, 6, 2).unwrap());

        let mut txn = db.begin();
        DistributionState::remove_pending(&mut txn, 5, 2);
        txn.commit().unwrap();
        assert_eq!(DistributionState::all_pending(&db).unwrap(), vec![(5, 3), (6, 2)]);
        assert!(DistributionState::get(&db, 5).unwrap().is_some());
    }
}
