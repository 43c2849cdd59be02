//! Ordered, idempotent migrations of the state store
//!
//! Migrations run once per partition start, before the stream processor
//! opens the store for processing. Each task decides from the store content
//! alone whether it has work to do, so running the migrator twice is a no-op.

use super::{
    long_key, read_long, InstanceRecord, InstanceState, InstanceStatus, Keyspace, LegacyInstance, StateDb, StateError,
    StateRead, TimerState, Transaction,
};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};

pub trait MigrationTask: Send + Sync {
    fn id(&self) -> &'static str;

    /// Pure predicate over the current store content.
    fn needs_to_run(&self, state: &StateDb) -> Result<bool, StateError>;

    fn run(&self, txn: &mut Transaction) -> Result<(), StateError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub id: String,
    /// How many times the task found work to do.
    pub runs: u32,
}

/// Moves instances from the `{key, typeName, active}` layout into `instances`.
pub struct LegacyInstanceLayout;

impl MigrationTask for LegacyInstanceLayout {
    fn id(&self) -> &'static str {
        "legacy-instance-layout"
    }

    fn needs_to_run(&self, state: &StateDb) -> Result<bool, StateError> {
        Ok(!state.scan_raw(Keyspace::LegacyInstances, &[])?.is_empty())
    }

    fn run(&self, txn: &mut Transaction) -> Result<(), StateError> {
        for (key, value) in txn.scan_raw(Keyspace::LegacyInstances, &[])? {
            let legacy: LegacyInstance = serde_json::from_slice(&value)?;
            if read_long(&key)? != legacy.key {
                return Err(StateError::Corrupted(format!(
                    "legacy instance {} stored under another key",
                    legacy.key
                )));
            }
            let status = if legacy.active {
                InstanceStatus::Active
            } else {
                InstanceStatus::Completed
            };
            InstanceState::put(
                txn,
                &InstanceRecord {
                    key: legacy.key,
                    type_name: legacy.type_name,
                    status,
                },
            )?;
            txn.delete(Keyspace::LegacyInstances, &key);
        }
        Ok(())
    }
}

/// Adds timers missing from the due-date index.
pub struct TimerDueDateIndex;

impl MigrationTask for TimerDueDateIndex {
    fn id(&self) -> &'static str {
        "timer-due-date-index"
    }

    fn needs_to_run(&self, state: &StateDb) -> Result<bool, StateError> {
        for timer in TimerState::all(state)? {
            if !TimerState::is_indexed(state, &timer)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn run(&self, txn: &mut Transaction) -> Result<(), StateError> {
        for timer in TimerState::all(&*txn)? {
            if !TimerState::is_indexed(&*txn, &timer)? {
                TimerState::index(txn, &timer);
            }
        }
        Ok(())
    }
}

pub struct DbMigrator {
    tasks: Vec<Box<dyn MigrationTask>>,
    logger: Logger,
}

impl DbMigrator {
    /// The migrator with all known tasks in their fixed order.
    pub fn new(logger: Logger) -> Self {
        Self::with_tasks(vec![Box::new(LegacyInstanceLayout), Box::new(TimerDueDateIndex)], logger)
    }

    pub fn with_tasks(tasks: Vec<Box<dyn MigrationTask>>, logger: Logger) -> Self {
        Self { tasks, logger }
    }

    /// Run every task that has work to do, each in its own transaction.
    /// Returns the ids of the tasks that ran.
    pub fn run_migrations(&self, state: &StateDb) -> Result<Vec<&'static str>, StateError> {
        let mut applied = Vec::new();
        for task in &self.tasks {
            if !task.needs_to_run(state)? {
                continue;
            }
            info!(self.logger, "Running migration"; "migration" => task.id());
            let mut txn = state.begin();
            task.run(&mut txn)?;
            let runs = Self::applied(state, task.id())?.map_or(0, |a| a.runs);
            txn.put(
                Keyspace::Migrations,
                task.id().as_bytes(),
                &AppliedMigration {
                    id: task.id().to_string(),
                    runs: runs + 1,
                },
            )?;
            txn.commit()?;
            applied.push(task.id());
        }
        Ok(applied)
    }

    pub fn applied(state: &StateDb, id: &str) -> Result<Option<AppliedMigration>, StateError> {
        state.get_value(Keyspace::Migrations, id.as_bytes())
    }
}

/// Write an instance in the pre-migration layout. Used to set up upgrade tests.
pub fn put_legacy_instance(txn: &mut Transaction, instance: &LegacyInstance) -> Result<(), StateError> {
    txn.put(Keyspace::LegacyInstances, &long_key(instance.key), instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_logger;
    use crate::state::TimerRecord;

    fn legacy_store() -> (tempfile::TempDir, StateDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let mut txn = db.begin();
        put_legacy_instance(
            &mut txn,
            &LegacyInstance {
                key: 1,
                type_name: "Foo".into(),
                active: true,
            },
        )
        .unwrap();
        put_legacy_instance(
            &mut txn,
            &LegacyInstance {
                key: 2,
                type_name: "Bar".into(),
                active: false,
            },
        )
        .unwrap();
        txn.put(
            Keyspace::Timers,
            &long_key(3),
            &TimerRecord {
                key: 3,
                instance_key: 1,
                due_date: 1_000,
            },
        )
        .unwrap();
        txn.commit().unwrap();
        (dir, db)
    }

    #[test]
    fn test_migrations_apply_in_order() {
        let (_dir, db) = legacy_store();
        let migrator = DbMigrator::new(test_logger());
        let applied = migrator.run_migrations(&db).unwrap();
        assert_eq!(applied, vec!["legacy-instance-layout", "timer-due-date-index"]);

        let foo = InstanceState::get(&db, 1).unwrap().unwrap();
        assert_eq!(foo.status, InstanceStatus::Active);
        let bar = InstanceState::get(&db, 2).unwrap().unwrap();
        assert_eq!(bar.status, InstanceStatus::Completed);
        assert!(db.scan_raw(Keyspace::LegacyInstances, &[]).unwrap().is_empty());
        assert_eq!(TimerState::next_due_date(&db).unwrap(), Some(1_000));
        assert_eq!(
            DbMigrator::applied(&db, "legacy-instance-layout").unwrap().map(|a| a.runs),
            Some(1)
        );
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let (_dir, db) = legacy_store();
        let migrator = DbMigrator::new(test_logger());
        migrator.run_migrations(&db).unwrap();
        let before = db.dump().unwrap();

        assert!(migrator.run_migrations(&db).unwrap().is_empty());
        assert_eq!(db.dump().unwrap(), before);
    }

    #[test]
    fn test_fresh_store_needs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        assert!(DbMigrator::new(test_logger()).run_migrations(&db).unwrap().is_empty());
    }
}
