//! Workload data transfer between nodes.

use async_trait::async_trait;

use hearthgrid_state::{NodeInfo, NodeRole, WorkloadRecord};

/// Moves a workload's data directory onto a target node.
///
/// Both operations are long-running and report only success or failure.
#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Copy `path` from `source` to the same path on `target`.
    async fn sync_directory(
        &self,
        source: &NodeInfo,
        target: &NodeInfo,
        path: &str,
    ) -> anyhow::Result<()>;

    /// Restore snapshot `snapshot_id` into `path` on `target`.
    async fn restore_snapshot(
        &self,
        snapshot_id: &str,
        target: &NodeInfo,
        path: &str,
    ) -> anyhow::Result<()>;
}

/// How the data reaches the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPlan {
    /// Restore from the snapshot store, reachable from control-plane nodes.
    Snapshot { snapshot_id: String },
    /// Node-to-node copy between workers.
    Sync,
}

/// Choose the transfer method for moving `workload` off `source`.
pub fn plan_transfer(source: &NodeInfo, workload: &WorkloadRecord) -> Result<TransferPlan, String> {
    match (source.role, &workload.snapshot_id) {
        (NodeRole::ControlPlane, Some(snapshot_id)) => Ok(TransferPlan::Snapshot {
            snapshot_id: snapshot_id.clone(),
        }),
        (NodeRole::ControlPlane, None) => Err(format!(
            "workload {} has no snapshot to restore from control-plane node {}",
            workload.id, source.id
        )),
        (NodeRole::Worker, _) => Ok(TransferPlan::Sync),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearthgrid_scheduler::testing::{control_plane_node, worker_node, workload};

    #[test]
    fn workers_sync_directly() {
        let mut w = workload("w1", 1024);
        w.snapshot_id = Some("snap-1".to_string());
        assert_eq!(plan_transfer(&worker_node("a", 8192), &w), Ok(TransferPlan::Sync));
    }

    #[test]
    fn control_plane_source_restores_snapshot() {
        let mut w = workload("w1", 1024);
        w.snapshot_id = Some("snap-1".to_string());
        assert_eq!(
            plan_transfer(&control_plane_node("cp", 8192), &w),
            Ok(TransferPlan::Snapshot {
                snapshot_id: "snap-1".to_string()
            })
        );
    }

    #[test]
    fn control_plane_source_without_snapshot_fails() {
        let w = workload("w1", 1024);
        assert!(plan_transfer(&control_plane_node("cp", 8192), &w).is_err());
    }
}
