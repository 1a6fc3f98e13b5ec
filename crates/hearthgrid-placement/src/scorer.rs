//! Node scoring for placement decisions.
//!
//! Candidates that cannot fit the requirement are rejected outright. The
//! rest are ranked by the configured strategy:
//! - **Best-fit** (default): prefer the node left with the least free RAM,
//!   consolidating workloads so idle nodes can be reclaimed by the autoscaler
//! - **Worst-fit**: prefer the node left with the most free RAM (spread)
//! - **First-fit**: stable order by node id

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Placement strategy applied after filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    #[default]
    BestFit,
    WorstFit,
    FirstFit,
}

/// A node as seen by the scorer: filter flags plus live ledger numbers.
#[derive(Debug, Clone)]
pub struct NodeCandidate {
    pub node_id: String,
    pub healthy: bool,
    pub hostable: bool,
    pub capacity_mb: u64,
    pub free_mb: u64,
}

/// Scored placement result for a single node.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub node_id: String,
    /// Higher is better.
    pub score: f64,
    /// Free RAM left on the node after placing the requirement.
    pub free_after_mb: u64,
}

/// Score one candidate, or `None` if it cannot take the workload.
pub fn score_candidate(
    candidate: &NodeCandidate,
    required_mb: u64,
    strategy: PlacementStrategy,
) -> Option<NodeScore> {
    if !candidate.healthy || !candidate.hostable || candidate.free_mb < required_mb {
        return None;
    }

    let free_after_mb = candidate.free_mb - required_mb;
    let score = match strategy {
        PlacementStrategy::BestFit => -(free_after_mb as f64),
        PlacementStrategy::WorstFit => free_after_mb as f64,
        PlacementStrategy::FirstFit => 0.0,
    };

    Some(NodeScore {
        node_id: candidate.node_id.clone(),
        score,
        free_after_mb,
    })
}

/// Score and rank all candidates, best first.
///
/// Ties are broken by node id so ranking is deterministic.
pub fn rank_candidates(
    candidates: &[NodeCandidate],
    required_mb: u64,
    strategy: PlacementStrategy,
) -> Vec<NodeScore> {
    let mut scored: Vec<NodeScore> = candidates
        .iter()
        .filter_map(|c| score_candidate(c, required_mb, strategy))
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, capacity: u64, free: u64) -> NodeCandidate {
        NodeCandidate {
            node_id: id.to_string(),
            healthy: true,
            hostable: true,
            capacity_mb: capacity,
            free_mb: free,
        }
    }

    #[test]
    fn rejects_node_without_room() {
        let c = candidate("n1", 8192, 2048);
        assert!(score_candidate(&c, 4096, PlacementStrategy::BestFit).is_none());
    }

    #[test]
    fn rejects_unhealthy_and_control_plane() {
        let mut sick = candidate("n1", 8192, 8192);
        sick.healthy = false;
        let mut system = candidate("n2", 8192, 8192);
        system.hostable = false;

        assert!(score_candidate(&sick, 1024, PlacementStrategy::BestFit).is_none());
        assert!(score_candidate(&system, 1024, PlacementStrategy::BestFit).is_none());
    }

    #[test]
    fn exact_fit_is_accepted() {
        let c = candidate("n1", 8192, 4096);
        let score = score_candidate(&c, 4096, PlacementStrategy::BestFit).unwrap();
        assert_eq!(score.free_after_mb, 0);
    }

    #[test]
    fn best_fit_prefers_tightest_node() {
        let nodes = vec![
            candidate("roomy", 32768, 30000),
            candidate("tight", 16384, 5000),
            candidate("full", 16384, 1000),
        ];
        let ranked = rank_candidates(&nodes, 4096, PlacementStrategy::BestFit);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].node_id, "tight");
        assert_eq!(ranked[1].node_id, "roomy");
    }

    #[test]
    fn worst_fit_prefers_emptiest_node() {
        let nodes = vec![candidate("a", 16384, 5000), candidate("b", 32768, 30000)];
        let ranked = rank_candidates(&nodes, 4096, PlacementStrategy::WorstFit);
        assert_eq!(ranked[0].node_id, "b");
    }

    #[test]
    fn first_fit_orders_by_id() {
        let nodes = vec![candidate("c", 16384, 9000), candidate("a", 16384, 5000)];
        let ranked = rank_candidates(&nodes, 4096, PlacementStrategy::FirstFit);
        assert_eq!(ranked[0].node_id, "a");
        assert_eq!(ranked[1].node_id, "c");
    }

    #[test]
    fn ties_break_by_node_id() {
        let nodes = vec![candidate("n2", 8192, 8192), candidate("n1", 8192, 8192)];
        let ranked = rank_candidates(&nodes, 1024, PlacementStrategy::BestFit);
        assert_eq!(ranked[0].node_id, "n1");
    }
}
