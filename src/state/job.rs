use super::{long_key, read_long, Keyspace, StateError, StateRead, Transaction};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Activatable,
    /// Out of retries.
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: i64,
    pub instance_key: i64,
    pub job_type: String,
    pub retries: i32,
    pub status: JobStatus,
    #[serde(default)]
    pub error_message: String,
}

pub struct JobState;

impl JobState {
    pub fn get<R: StateRead>(state: &R, key: i64) -> Result<Option<JobRecord>, StateError> {
        state.get_value(Keyspace::Jobs, &long_key(key))
    }

    pub fn put(txn: &mut Transaction, job: &JobRecord) -> Result<(), StateError> {
        txn.put(Keyspace::Jobs, &long_key(job.key), job)
    }

    pub fn remove(txn: &mut Transaction, key: i64) {
        txn.delete(Keyspace::Jobs, &long_key(key));
    }

    pub fn of_instance<R: StateRead>(state: &R, instance_key: i64) -> Result<Vec<JobRecord>, StateError> {
        let jobs: Vec<JobRecord> = state.scan_values(Keyspace::Jobs, &[])?;
        Ok(jobs.into_iter().filter(|j| j.instance_key == instance_key).collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub key: i64,
    pub instance_key: i64,
    pub due_date: i64,
}

/// Timers plus an index ordered by due date.
pub struct TimerState;

impl TimerState {
    fn due_date_key(due_date: i64, key: i64) -> Vec<u8> {
        let mut index_key = long_key(due_date).to_vec();
        index_key.extend_from_slice(&long_key(key));
        index_key
    }

    pub fn get<R: StateRead>(state: &R, key: i64) -> Result<Option<TimerRecord>, StateError> {
        state.get_value(Keyspace::Timers, &long_key(key))
    }

    pub fn put(txn: &mut Transaction, timer: &TimerRecord) -> Result<(), StateError> {
        txn.put(Keyspace::Timers, &long_key(timer.key), timer)?;
        Self::index(txn, timer);
        Ok(())
    }

    pub(crate) fn index(txn: &mut Transaction, timer: &TimerRecord) {
        txn.put_raw(Keyspace::TimerDueDates, &Self::due_date_key(timer.due_date, timer.key), Vec::new());
    }

    pub(crate) fn is_indexed<R: StateRead>(state: &R, timer: &TimerRecord) -> Result<bool, StateError> {
        state.exists(Keyspace::TimerDueDates, &Self::due_date_key(timer.due_date, timer.key))
    }

    pub fn remove(txn: &mut Transaction, timer: &TimerRecord) {
        txn.delete(Keyspace::Timers, &long_key(timer.key));
        txn.delete(Keyspace::TimerDueDates, &Self::due_date_key(timer.due_date, timer.key));
    }

    pub fn all<R: StateRead>(state: &R) -> Result<Vec<TimerRecord>, StateError> {
        state.scan_values(Keyspace::Timers, &[])
    }

    pub fn of_instance<R: StateRead>(state: &R, instance_key: i64) -> Result<Vec<TimerRecord>, StateError> {
        Ok(Self::all(state)?
            .into_iter()
            .filter(|t| t.instance_key == instance_key)
            .collect())
    }

    /// Timers due at or before `now`, earliest first.
    pub fn due<R: StateRead>(state: &R, now: i64) -> Result<Vec<TimerRecord>, StateError> {
        let mut due = Vec::new();
        for (index_key, _) in state.scan_raw(Keyspace::TimerDueDates, &[])? {
            if read_long(&index_key)? > now {
                break;
            }
            let key = read_long(&index_key[8..])?;
            if let Some(timer) = Self::get(state, key)? {
                due.push(timer);
            }
        }
        Ok(due)
    }

    /// Earliest due date, if any timer is pending.
    pub fn next_due_date<R: StateRead>(state: &R) -> Result<Option<i64>, StateError> {
        match state.scan_raw(Keyspace::TimerDueDates, &[])?.first() {
            Some((index_key, _)) => Ok(Some(read_long(index_key)?)),
            None => Ok(None),
        }
    }

    /// Earliest due date strictly after `after`.
    pub fn next_due_date_after<R: StateRead>(state: &R, after: i64) -> Result<Option<i64>, StateError> {
        for (index_key, _) in state.scan_raw(Keyspace::TimerDueDates, &[])? {
            let due_date = read_long(&index_key)?;
            if due_date > after {
                return Ok(Some(due_date));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateDb;

    #[test]
    fn test_due_timers_in_due_date_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let mut txn = db.begin();
        for (key, due_date) in [(1, 300), (2, 100), (3, 200)] {
            TimerState::put(
                &mut txn,
                &TimerRecord {
                    key,
                    instance_key: 9,
                    due_date,
                },
            )
            .unwrap();
        }
        txn.commit().unwrap();

        let due: Vec<i64> = TimerState::due(&db, 250).unwrap().iter().map(|t| t.key).collect();
        assert_eq!(due, vec![2, 3]);
        assert_eq!(TimerState::next_due_date(&db).unwrap(), Some(100));
        assert_eq!(TimerState::next_due_date_after(&db, 250).unwrap(), Some(300));
        assert_eq!(TimerState::next_due_date_after(&db, 300).unwrap(), None);

        let mut txn = db.begin();
        let timer = TimerState::get(&txn, 2).unwrap().unwrap();
        TimerState::remove(&mut txn, &timer);
        txn.commit().unwrap();
        assert_eq!(TimerState::next_due_date(&db).unwrap(), Some(200));
        assert_eq!(TimerState::of_instance(&db, 9).unwrap().len(), 2);
    }

    #[test]
    fn test_jobs_of_instance() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let mut txn = db.begin();
        for (key, instance_key) in [(1, 10), (2, 11), (3, 10)] {
            JobState::put(
                &mut txn,
                &JobRecord {
                    key,
                    instance_key,
                    job_type: "work".into(),
                    retries: 3,
                    status: JobStatus::Activatable,
                    error_message: String::new(),
                },
            )
            .unwrap();
        }
        JobState::remove(&mut txn, 3);
        txn.commit().unwrap();
        let keys: Vec<i64> = JobState::of_instance(&db, 10).unwrap().iter().map(|j| j.key).collect();
        assert_eq!(keys, vec![1]);
    }
}
