//! Cost advisor: finds running workloads that would be cheaper elsewhere.
//!
//! Only workloads that opted in (`mode` Suggest or Auto with a
//! cost-optimization level) are considered. Suggest mode records a
//! `Suggested` migration for approval; Auto mode schedules it directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use hearthgrid_state::{
    MigrationMode, MigrationReason, NodeId, NodeInfo, WorkloadId, WorkloadRecord, WorkloadStatus,
};

use crate::error::{MigrateError, MigrateResult};
use crate::orchestrator::{MigrationOrchestrator, MigrationRequest};

const HOURS_PER_MONTH: f64 = 730.0;

/// Monthly price of `ram_mb` on `node`.
pub fn monthly_cost(node: &NodeInfo, ram_mb: u64) -> f64 {
    ram_mb as f64 / 1024.0 * node.cost_per_gb_hour * HOURS_PER_MONTH
}

/// A cheaper placement for one workload.
#[derive(Debug, Clone, PartialEq)]
pub struct CostAdvice {
    pub workload_id: WorkloadId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub current_monthly_cost: f64,
    pub target_monthly_cost: f64,
    pub monthly_savings: f64,
}

/// Outcome of one advisor scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdvisorReport {
    pub suggested: usize,
    pub scheduled: usize,
    /// Advice found but not recorded (ineligible or already migrating).
    pub skipped: usize,
}

pub struct CostAdvisor {
    orchestrator: Arc<MigrationOrchestrator>,
}

impl CostAdvisor {
    pub fn new(orchestrator: Arc<MigrationOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// The cheapest node that could take `workload` now, if the saving
    /// clears the workload's cost-optimization threshold.
    pub fn evaluate(&self, workload: &WorkloadRecord) -> MigrateResult<Option<CostAdvice>> {
        let prefs = &workload.migration;
        if !prefs.allow_migration || prefs.mode == MigrationMode::Manual {
            return Ok(None);
        }
        let Some(threshold) = prefs.cost_optimization.min_savings_ratio() else {
            return Ok(None);
        };
        if workload.status != WorkloadStatus::Running {
            return Ok(None);
        }
        let Some(current_id) = &workload.node_id else {
            return Ok(None);
        };

        let lifecycle = self.orchestrator.lifecycle();
        let nodes: HashMap<NodeId, NodeInfo> = lifecycle
            .state()
            .list_nodes()?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let Some(current) = nodes.get(current_id) else {
            return Ok(None);
        };
        let current_cost = monthly_cost(current, workload.booked_ram_mb);
        if current_cost <= 0.0 {
            return Ok(None);
        }

        let cheapest = lifecycle
            .selector()
            .rank(workload.booked_ram_mb)?
            .into_iter()
            .filter(|score| score.node_id != *current_id)
            .filter_map(|score| nodes.get(&score.node_id))
            .map(|node| (node, monthly_cost(node, workload.booked_ram_mb)))
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));

        let Some((target, target_cost)) = cheapest else {
            return Ok(None);
        };
        let savings = current_cost - target_cost;
        if savings / current_cost < threshold {
            return Ok(None);
        }
        Ok(Some(CostAdvice {
            workload_id: workload.id.clone(),
            from_node: current_id.clone(),
            to_node: target.id.clone(),
            current_monthly_cost: current_cost,
            target_monthly_cost: target_cost,
            monthly_savings: savings,
        }))
    }

    /// Evaluate every running workload and record the resulting migrations.
    pub fn scan(&self) -> MigrateResult<AdvisorReport> {
        let mut report = AdvisorReport::default();
        let state = self.orchestrator.lifecycle().state();

        for workload in state.list_workloads_by_status(&[WorkloadStatus::Running])? {
            if state.has_active_migration(&workload.id)? {
                continue;
            }
            let Some(advice) = self.evaluate(&workload)? else {
                continue;
            };
            let request = MigrationRequest::manual(workload.id.clone())
                .with_target(advice.to_node.clone())
                .with_reason(MigrationReason::CostOptimization);

            let recorded = match workload.migration.mode {
                MigrationMode::Auto => self.orchestrator.schedule_migration(request),
                _ => self
                    .orchestrator
                    .suggest_migration(request, advice.monthly_savings),
            };
            match recorded {
                Ok(m) => {
                    if workload.migration.mode == MigrationMode::Auto {
                        report.scheduled += 1;
                    } else {
                        report.suggested += 1;
                    }
                    info!(
                        migration_id = %m.id,
                        workload_id = %advice.workload_id,
                        from = %advice.from_node,
                        to = %advice.to_node,
                        monthly_savings = advice.monthly_savings,
                        "cost migration recorded"
                    );
                }
                Err(MigrateError::NotEligible { .. } | MigrateError::AlreadyActive(_)) => {
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(workload_id = %workload.id, error = %e, "could not record cost migration");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Scan every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "cost advisor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.scan() {
                        Ok(report) => debug!(
                            suggested = report.suggested,
                            scheduled = report.scheduled,
                            skipped = report.skipped,
                            "cost scan complete"
                        ),
                        Err(e) => warn!(error = %e, "cost scan failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("cost advisor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hearthgrid_scheduler::testing::worker_node;

    #[test]
    fn monthly_cost_scales_with_ram_and_price() {
        let mut node = worker_node("n1", 16384);
        node.cost_per_gb_hour = 0.01;
        let cost = monthly_cost(&node, 4096);
        assert!((cost - 29.2).abs() < 1e-9);
        assert_eq!(monthly_cost(&node, 0), 0.0);
    }
}
