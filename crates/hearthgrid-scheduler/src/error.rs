//! Scheduler error types.

use std::fmt;

use thiserror::Error;

use hearthgrid_state::WorkloadStatus;

/// Why a start request was parked in the queue instead of running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    /// Host load or ledger capacity does not allow the boot right now.
    Capacity,
    /// Another workload holds the boot slot.
    Contention,
    /// No healthy, hostable node has room.
    Placement,
}

impl fmt::Display for QueueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueReason::Capacity => "insufficient capacity",
            QueueReason::Contention => "boot slot contention",
            QueueReason::Placement => "no eligible node",
        })
    }
}

/// Step of a container operation, for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unarchive,
    Create,
    Start,
    Stop,
    Remove,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Unarchive => "unarchive",
            Phase::Create => "container create",
            Phase::Start => "container start",
            Phase::Stop => "container stop",
            Phase::Remove => "container remove",
        })
    }
}

/// Errors that can occur during lifecycle operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("workload {workload_id} is already {status}")]
    AlreadyActive {
        workload_id: String,
        status: WorkloadStatus,
    },

    #[error("workload {workload_id} is not running (status: {status})")]
    NotRunning {
        workload_id: String,
        status: WorkloadStatus,
    },

    #[error("workload {workload_id} cannot start from status {status}")]
    NotStartable {
        workload_id: String,
        status: WorkloadStatus,
    },

    #[error("workload {0} is not queued")]
    NotQueued(String),

    #[error("workload {workload_id} is being migrated by {migration_id}")]
    MigrationInProgress {
        workload_id: String,
        migration_id: String,
    },

    /// Non-fatal: the workload waits in the start queue.
    #[error("workload {workload_id} queued ({reason}): {detail}")]
    Queued {
        workload_id: String,
        reason: QueueReason,
        detail: String,
    },

    /// Fatal to the attempt; all reservations were rolled back.
    #[error("{phase} failed for workload {workload_id} on node {node_id}: {source}")]
    Runtime {
        workload_id: String,
        node_id: String,
        phase: Phase,
        source: anyhow::Error,
    },

    #[error("state store error: {0}")]
    State(#[from] hearthgrid_state::StateError),

    #[error("placement error: {0}")]
    Placement(#[from] hearthgrid_placement::PlacementError),
}

impl SchedulerError {
    /// Whether this is a contention outcome (the workload was queued)
    /// rather than a failure.
    pub fn is_queued(&self) -> bool {
        matches!(self, SchedulerError::Queued { .. })
    }

    pub fn queue_reason(&self) -> Option<QueueReason> {
        match self {
            SchedulerError::Queued { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
