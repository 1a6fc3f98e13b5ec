//! Placement error types.

use thiserror::Error;

/// Errors that can occur while selecting a node.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// No healthy, hostable node has enough free RAM. Callers treat this
    /// as capacity exhaustion, not as a crash.
    #[error("no eligible node for {required_mb}MB ({considered} nodes considered)")]
    NoEligibleNode { required_mb: u64, considered: usize },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("state store error: {0}")]
    State(#[from] hearthgrid_state::StateError),
}

pub type PlacementResult<T> = Result<T, PlacementError>;
