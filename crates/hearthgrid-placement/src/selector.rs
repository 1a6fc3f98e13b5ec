//! Node selector: picks a target node for a RAM requirement.
//!
//! Node health and role come from the state store; free capacity comes
//! from the live [`ResourceLedger`]. Selection does not reserve anything:
//! callers must follow up with `try_allocate`, which may still fail if
//! another request claimed the space in between.

use std::sync::Arc;

use tracing::debug;

use hearthgrid_state::{NodeId, StateStore};

use crate::error::{PlacementError, PlacementResult};
use crate::ledger::ResourceLedger;
use crate::scorer::{NodeCandidate, NodeScore, PlacementStrategy, rank_candidates};

/// Chooses nodes for workloads.
#[derive(Clone)]
pub struct NodeSelector {
    state: StateStore,
    ledger: Arc<ResourceLedger>,
    strategy: PlacementStrategy,
}

impl NodeSelector {
    pub fn new(state: StateStore, ledger: Arc<ResourceLedger>) -> Self {
        Self {
            state,
            ledger,
            strategy: PlacementStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: PlacementStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> PlacementStrategy {
        self.strategy
    }

    /// Pick the best node with at least `required_mb` free.
    pub fn select_node(&self, required_mb: u64) -> PlacementResult<NodeId> {
        self.select_node_excluding(required_mb, &[])
    }

    /// Like [`select_node`](Self::select_node), never returning a node in `exclude`.
    pub fn select_node_excluding(
        &self,
        required_mb: u64,
        exclude: &[&str],
    ) -> PlacementResult<NodeId> {
        let candidates: Vec<NodeCandidate> = self
            .candidates()?
            .into_iter()
            .filter(|c| !exclude.contains(&c.node_id.as_str()))
            .collect();
        let considered = candidates.len();

        let ranked = rank_candidates(&candidates, required_mb, self.strategy);
        match ranked.into_iter().next() {
            Some(best) => {
                debug!(
                    node = %best.node_id,
                    required_mb,
                    free_after_mb = best.free_after_mb,
                    strategy = ?self.strategy,
                    "node selected"
                );
                Ok(best.node_id)
            }
            None => Err(PlacementError::NoEligibleNode {
                required_mb,
                considered,
            }),
        }
    }

    /// Pick `preferred` if it is still eligible, otherwise the best node.
    ///
    /// Used to keep a workload on the node that already holds its data.
    pub fn select_node_preferring(
        &self,
        required_mb: u64,
        preferred: Option<&str>,
    ) -> PlacementResult<NodeId> {
        if let Some(preferred) = preferred {
            if self
                .rank(required_mb)?
                .iter()
                .any(|score| score.node_id == preferred)
            {
                debug!(node = %preferred, required_mb, "preferred node selected");
                return Ok(preferred.to_string());
            }
        }
        self.select_node(required_mb)
    }

    /// All eligible nodes for `required_mb`, best first.
    pub fn rank(&self, required_mb: u64) -> PlacementResult<Vec<NodeScore>> {
        Ok(rank_candidates(&self.candidates()?, required_mb, self.strategy))
    }

    /// Whether some eligible node currently has room for `required_mb`.
    pub fn fits_anywhere(&self, required_mb: u64) -> PlacementResult<bool> {
        Ok(!self.rank(required_mb)?.is_empty())
    }

    /// Whether `node_id` may receive workloads (exists and is not control-plane).
    pub fn is_hostable(&self, node_id: &str) -> PlacementResult<bool> {
        Ok(self
            .state
            .get_node(node_id)?
            .is_some_and(|n| n.is_hostable()))
    }

    /// Build candidates from persisted nodes joined with ledger usage.
    ///
    /// Nodes missing from the ledger are skipped: they cannot accept
    /// allocations anyway.
    fn candidates(&self) -> PlacementResult<Vec<NodeCandidate>> {
        let usage = self.ledger.snapshot();
        let nodes = self.state.list_nodes()?;
        Ok(nodes
            .into_iter()
            .filter_map(|n| {
                let Some(entry) = usage.get(&n.id) else {
                    debug!(node = %n.id, "node not registered in ledger, skipping");
                    return None;
                };
                Some(NodeCandidate {
                    hostable: n.is_hostable(),
                    node_id: n.id,
                    healthy: n.healthy,
                    capacity_mb: entry.capacity_mb,
                    free_mb: entry.free_mb(),
                })
            })
            .collect())
    }
}
