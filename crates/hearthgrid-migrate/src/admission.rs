//! Migration admission (`can_execute`).
//!
//! Decides whether a workload may be migrated right now. The
//! one-active-migration rule is not checked here: it is enforced
//! atomically by the state store when a migration is created.

use std::time::Duration;

use hearthgrid_state::{MigrationReason, WorkloadRecord, WorkloadStatus};

/// Migration tuning.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Failed attempts allowed before a migration stays failed.
    pub max_retries: u32,
    /// Minimum time a workload must have been running before a
    /// cost-driven move.
    pub min_dwell: Duration,
    /// Delay before a failed or deferred migration is attempted again.
    pub retry_backoff: Duration,
    /// How long the target container gets to become ready.
    pub ready_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_dwell: Duration::from_secs(1800),
            retry_backoff: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(180),
        }
    }
}

/// Why a workload cannot be migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ineligible {
    pub reason: String,
    /// The condition may clear by itself (occupants leave, dwell elapses).
    pub transient: bool,
}

impl Ineligible {
    fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: false,
        }
    }

    fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: true,
        }
    }
}

/// Check whether `workload` may be migrated for `reason` at `now`.
///
/// - the workload must allow migration and have a node
/// - cost-driven moves need a running workload with no occupants that has
///   been up for at least `min_dwell`
/// - manual moves also accept stopped and sleeping workloads
pub fn can_execute(
    workload: &WorkloadRecord,
    reason: MigrationReason,
    now: u64,
    config: &MigrationConfig,
) -> Result<(), Ineligible> {
    if !workload.migration.allow_migration {
        return Err(Ineligible::permanent("migration is disabled for this workload"));
    }
    if workload.node_id.is_none() {
        return Err(Ineligible::permanent("workload has no node"));
    }

    match reason {
        MigrationReason::CostOptimization => {
            if workload.status != WorkloadStatus::Running {
                return Err(Ineligible::permanent(format!(
                    "cost migrations require a running workload (status: {})",
                    workload.status
                )));
            }
            if workload.occupants > 0 {
                return Err(Ineligible::transient(format!(
                    "{} occupants connected",
                    workload.occupants
                )));
            }
            let since = workload.last_started_at.unwrap_or(0);
            let dwell = now.saturating_sub(since);
            if dwell < config.min_dwell.as_secs() {
                return Err(Ineligible::transient(format!(
                    "running for {dwell}s, minimum is {}s",
                    config.min_dwell.as_secs()
                )));
            }
        }
        MigrationReason::Manual => {
            if !matches!(
                workload.status,
                WorkloadStatus::Running | WorkloadStatus::Stopped | WorkloadStatus::Sleeping
            ) {
                return Err(Ineligible::permanent(format!(
                    "workload status {} cannot be migrated",
                    workload.status
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearthgrid_scheduler::testing::workload;

    fn running(occupants: u32, started_at: u64) -> WorkloadRecord {
        let mut w = workload("w1", 4096);
        w.status = WorkloadStatus::Running;
        w.node_id = Some("n1".to_string());
        w.occupants = occupants;
        w.last_started_at = Some(started_at);
        w
    }

    #[test]
    fn manual_move_of_running_workload_is_allowed() {
        let w = running(5, 9_990);
        assert!(can_execute(&w, MigrationReason::Manual, 10_000, &MigrationConfig::default()).is_ok());
    }

    #[test]
    fn manual_move_of_stopped_workload_is_allowed() {
        let mut w = workload("w1", 4096);
        w.node_id = Some("n1".to_string());
        assert!(can_execute(&w, MigrationReason::Manual, 0, &MigrationConfig::default()).is_ok());
        w.status = WorkloadStatus::Sleeping;
        assert!(can_execute(&w, MigrationReason::Manual, 0, &MigrationConfig::default()).is_ok());
    }

    #[test]
    fn cost_move_requires_running() {
        let mut w = workload("w1", 4096);
        w.node_id = Some("n1".to_string());
        let err = can_execute(&w, MigrationReason::CostOptimization, 0, &MigrationConfig::default())
            .unwrap_err();
        assert!(!err.transient);
    }

    #[test]
    fn cost_move_waits_for_empty_server() {
        let w = running(2, 0);
        let err = can_execute(&w, MigrationReason::CostOptimization, 10_000, &MigrationConfig::default())
            .unwrap_err();
        assert!(err.transient);
        assert!(err.reason.contains("2 occupants"));
    }

    #[test]
    fn cost_move_respects_dwell_time() {
        let config = MigrationConfig::default();
        let w = running(0, 10_000);
        assert!(can_execute(&w, MigrationReason::CostOptimization, 10_000 + 1799, &config)
            .unwrap_err()
            .transient);
        assert!(can_execute(&w, MigrationReason::CostOptimization, 10_000 + 1800, &config).is_ok());
    }

    #[test]
    fn opt_out_and_transitional_states_are_refused() {
        let mut w = running(0, 0);
        w.migration.allow_migration = false;
        assert!(can_execute(&w, MigrationReason::Manual, 0, &MigrationConfig::default()).is_err());

        let mut w = running(0, 0);
        w.status = WorkloadStatus::Starting;
        assert!(can_execute(&w, MigrationReason::Manual, 0, &MigrationConfig::default()).is_err());

        let mut w = running(0, 0);
        w.node_id = None;
        assert!(can_execute(&w, MigrationReason::Manual, 0, &MigrationConfig::default()).is_err());
    }
}
