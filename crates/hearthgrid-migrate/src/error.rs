use thiserror::Error;

use hearthgrid_state::MigrationStatus;

/// Errors from migration operations.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("migration not found: {0}")]
    MigrationNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("workload {workload_id} cannot be migrated: {reason}")]
    NotEligible { workload_id: String, reason: String },

    #[error("workload {0} already has an active migration")]
    AlreadyActive(String),

    #[error("target node {0} cannot receive workloads")]
    InvalidTarget(String),

    #[error("migration {id} cannot move to {to} (status: {from})")]
    IllegalTransition {
        id: String,
        from: MigrationStatus,
        to: MigrationStatus,
    },

    #[error("migration {migration_id} of workload {workload_id} failed while {phase}: {source}")]
    PhaseFailed {
        migration_id: String,
        workload_id: String,
        phase: MigrationStatus,
        source: anyhow::Error,
    },

    #[error("state store error: {0}")]
    State(#[from] hearthgrid_state::StateError),

    #[error("placement error: {0}")]
    Placement(#[from] hearthgrid_placement::PlacementError),
}

pub type MigrateResult<T> = Result<T, MigrateError>;
