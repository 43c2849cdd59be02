use super::{long_key, Keyspace, StateError, StateRead, Transaction};
use crate::protocol::VariableDocument;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Active,
    Completed,
    Canceled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub key: i64,
    pub type_name: String,
    pub status: InstanceStatus,
}

impl InstanceRecord {
    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }
}

/// Instance layout written before schema version 2. Only migrations read it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyInstance {
    pub key: i64,
    pub type_name: String,
    pub active: bool,
}

pub struct InstanceState;

impl InstanceState {
    pub fn get<R: StateRead>(state: &R, key: i64) -> Result<Option<InstanceRecord>, StateError> {
        state.get_value(Keyspace::Instances, &long_key(key))
    }

    pub fn put(txn: &mut Transaction, record: &InstanceRecord) -> Result<(), StateError> {
        txn.put(Keyspace::Instances, &long_key(record.key), record)
    }

    pub fn set_status(txn: &mut Transaction, key: i64, status: InstanceStatus) -> Result<(), StateError> {
        let mut record = Self::get(&*txn, key)?
            .ok_or_else(|| StateError::Corrupted(format!("instance {} does not exist", key)))?;
        record.status = status;
        Self::put(txn, &record)
    }

    pub fn all<R: StateRead>(state: &R) -> Result<Vec<InstanceRecord>, StateError> {
        state.scan_values(Keyspace::Instances, &[])
    }
}

/// Variables, keyed by scope key then name.
pub struct VariableState;

impl VariableState {
    fn key(scope_key: i64, name: &str) -> Vec<u8> {
        let mut key = long_key(scope_key).to_vec();
        key.extend_from_slice(name.as_bytes());
        key
    }

    pub fn get<R: StateRead>(state: &R, scope_key: i64, name: &str) -> Result<Option<serde_json::Value>, StateError> {
        state.get_value(Keyspace::Variables, &Self::key(scope_key, name))
    }

    pub fn set(txn: &mut Transaction, scope_key: i64, name: &str, value: &serde_json::Value) -> Result<(), StateError> {
        txn.put(Keyspace::Variables, &Self::key(scope_key, name), value)
    }

    pub fn document<R: StateRead>(state: &R, scope_key: i64) -> Result<VariableDocument, StateError> {
        let prefix = long_key(scope_key);
        state
            .scan_raw(Keyspace::Variables, &prefix)?
            .into_iter()
            .map(|(k, v)| {
                let name = String::from_utf8(k[prefix.len()..].to_vec()).map_err(|e| StateError::Corrupted(e.to_string()))?;
                Ok((name, serde_json::from_slice(&v)?))
            })
            .collect()
    }

    pub fn remove_scope(txn: &mut Transaction, scope_key: i64) -> Result<(), StateError> {
        for (key, _) in txn.scan_raw(Keyspace::Variables, &long_key(scope_key))? {
            txn.delete(Keyspace::Variables, &key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateDb;
    use serde_json::json;

    #[test]
    fn test_instance_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let mut txn = db.begin();
        InstanceState::put(
            &mut txn,
            &InstanceRecord {
                key: 7,
                type_name: "Foo".into(),
                status: InstanceStatus::Active,
            },
        )
        .unwrap();
        InstanceState::set_status(&mut txn, 7, InstanceStatus::Completed).unwrap();
        txn.commit().unwrap();

        let record = InstanceState::get(&db, 7).unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert!(!record.is_active());
    }

    #[test]
    fn test_variables_scoped_by_instance() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let mut txn = db.begin();
        VariableState::set(&mut txn, 1, "a", &json!(1)).unwrap();
        VariableState::set(&mut txn, 1, "b", &json!("x")).unwrap();
        VariableState::set(&mut txn, 2, "a", &json!(true)).unwrap();
        txn.commit().unwrap();

        let doc = VariableState::document(&db, 1).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc["b"], json!("x"));

        let mut txn = db.begin();
        VariableState::remove_scope(&mut txn, 1).unwrap();
        assert!(VariableState::document(&txn, 1).unwrap().is_empty());
        txn.commit().unwrap();
        assert_eq!(VariableState::get(&db, 2, "a").unwrap(), Some(json!(true)));
    }
}
