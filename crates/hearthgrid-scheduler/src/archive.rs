//! Restoring archived workloads.

use async_trait::async_trait;

use hearthgrid_state::WorkloadRecord;

/// Brings an archived workload's data back onto a node before it starts.
#[async_trait]
pub trait Unarchiver: Send + Sync {
    async fn unarchive(&self, workload: &WorkloadRecord) -> anyhow::Result<()>;
}
