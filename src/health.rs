//! Partition health monitoring
//!
//! Components report their status to a shared [`HealthMonitor`]; the partition's
//! health is the worst status reported by any component. Fault counters track
//! recoverable faults (replication timeouts, processing errors, snapshot
//! failures) that do not change the status on their own.

use serde::Serialize;
use slog::{error, warn, Logger};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Health of a single component or of a whole partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    /// Degraded but recovering on its own.
    Unhealthy(String),
    /// Unrecoverable without operator intervention.
    Dead(String),
}

impl HealthStatus {
    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unhealthy(_) => 1,
            HealthStatus::Dead(_) => 2,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, HealthStatus::Dead(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy(reason) => write!(f, "unhealthy: {}", reason),
            HealthStatus::Dead(reason) => write!(f, "dead: {}", reason),
        }
    }
}

/// Counted fault categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Replication,
    Processing,
    Snapshot,
    Backup,
}

/// Point-in-time view of a partition's health.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, HealthStatus>,
    pub replication_faults: u64,
    pub processing_faults: u64,
    pub snapshot_faults: u64,
    pub backup_faults: u64,
}

#[derive(Default)]
struct FaultCounters {
    replication: AtomicU64,
    processing: AtomicU64,
    snapshot: AtomicU64,
    backup: AtomicU64,
}

/// Shared, cloneable health registry for one partition.
#[derive(Clone)]
pub struct HealthMonitor {
    components: Arc<Mutex<BTreeMap<String, HealthStatus>>>,
    faults: Arc<FaultCounters>,
    logger: Logger,
}

impl HealthMonitor {
    pub fn new(logger: Logger) -> Self {
        Self {
            components: Arc::new(Mutex::new(BTreeMap::new())),
            faults: Arc::new(FaultCounters::default()),
            logger,
        }
    }

    /// Record the status of `component`, replacing its previous status.
    pub fn report(&self, component: &str, status: HealthStatus) {
        let mut components = self.components.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = components.insert(component.to_string(), status.clone());
        if previous.as_ref() != Some(&status) {
            match &status {
                HealthStatus::Dead(reason) => {
                    error!(self.logger, "Component is dead"; "component" => component, "reason" => reason)
                }
                HealthStatus::Unhealthy(reason) => {
                    warn!(self.logger, "Component is unhealthy"; "component" => component, "reason" => reason)
                }
                HealthStatus::Healthy => {}
            }
        }
    }

    /// Drop a component, e.g. when its actor is closed on a role transition.
    pub fn remove(&self, component: &str) {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(component);
    }

    pub fn record_fault(&self, fault: Fault) -> u64 {
        let counter = match fault {
            Fault::Replication => &self.faults.replication,
            Fault::Processing => &self.faults.processing,
            Fault::Snapshot => &self.faults.snapshot,
            Fault::Backup => &self.faults.backup,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Worst status across all components.
    pub fn status(&self) -> HealthStatus {
        let components = self.components.lock().unwrap_or_else(PoisonError::into_inner);
        components
            .values()
            .max_by_key(|s| s.severity())
            .cloned()
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn report_snapshot(&self) -> HealthReport {
        let components = self
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        HealthReport {
            status: self.status(),
            components,
            replication_faults: self.faults.replication.load(Ordering::Relaxed),
            processing_faults: self.faults.processing.load(Ordering::Relaxed),
            snapshot_faults: self.faults.snapshot.load(Ordering::Relaxed),
            backup_faults: self.faults.backup.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_logger;

    #[test]
    fn test_worst_status_wins() {
        let monitor = HealthMonitor::new(test_logger());
        assert_eq!(monitor.status(), HealthStatus::Healthy);

        monitor.report("raft", HealthStatus::Healthy);
        monitor.report("snapshot", HealthStatus::Unhealthy("log growth".into()));
        assert_eq!(monitor.status(), HealthStatus::Unhealthy("log growth".into()));

        monitor.report("stream-processor", HealthStatus::Dead("replay failed".into()));
        assert!(monitor.status().is_dead());

        monitor.remove("stream-processor");
        assert!(!monitor.status().is_dead());
    }

    #[test]
    fn test_fault_counters() {
        let monitor = HealthMonitor::new(test_logger());
        monitor.record_fault(Fault::Replication);
        monitor.record_fault(Fault::Replication);
        monitor.record_fault(Fault::Snapshot);

        let report = monitor.report_snapshot();
        assert_eq!(report.replication_faults, 2);
        assert_eq!(report.snapshot_faults, 1);
        assert_eq!(report.processing_faults, 0);
    }
}
