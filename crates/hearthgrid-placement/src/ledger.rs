//! Resource ledger: per-node RAM accounting.
//!
//! Every reservation of booked RAM goes through [`ResourceLedger::try_allocate`],
//! which checks and increments under one lock. The lock is only held for the
//! arithmetic; callers never hold it across I/O.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};

use hearthgrid_state::{NodeId, StateResult, StateStore, WorkloadId};

/// Capacity and current allocation of one node, in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLedger {
    pub capacity_mb: u64,
    pub allocated_mb: u64,
}

impl NodeLedger {
    pub fn free_mb(&self) -> u64 {
        self.capacity_mb.saturating_sub(self.allocated_mb)
    }
}

/// Outcome of rebuilding the ledger from persisted state.
#[derive(Debug, Default)]
pub struct RebuildReport {
    pub nodes: usize,
    pub charged: Vec<WorkloadId>,
    /// Workloads whose charge did not fit their node's capacity.
    pub rejected: Vec<WorkloadId>,
}

/// Process-wide RAM ledger, owned by the orchestrator and shared by `Arc`.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    nodes: Mutex<HashMap<NodeId, NodeLedger>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruct the ledger from persisted node and workload records.
    ///
    /// Every node is registered with its capacity, then each workload that
    /// holds an allocation is charged to its node.
    pub fn rebuild(state: &StateStore) -> StateResult<(Self, RebuildReport)> {
        let ledger = Self::new();
        let mut report = RebuildReport::default();

        for node in state.list_nodes()? {
            ledger.register_node(&node.id, node.capacity_ram_mb);
            report.nodes += 1;
        }

        for workload in state.list_workloads()? {
            if !workload.holds_allocation() {
                continue;
            }
            let Some(node_id) = workload.node_id.as_deref() else {
                continue;
            };
            if ledger.try_allocate(node_id, workload.booked_ram_mb) {
                report.charged.push(workload.id.clone());
            } else {
                error!(
                    workload_id = %workload.id,
                    %node_id,
                    booked_mb = workload.booked_ram_mb,
                    "allocation does not fit node capacity during ledger rebuild"
                );
                report.rejected.push(workload.id.clone());
            }
        }

        debug!(
            nodes = report.nodes,
            charged = report.charged.len(),
            rejected = report.rejected.len(),
            "ledger rebuilt"
        );
        Ok((ledger, report))
    }

    /// Register a node or update its capacity, keeping its current allocation.
    pub fn register_node(&self, node_id: &str, capacity_mb: u64) {
        let mut nodes = self.lock();
        let entry = nodes.entry(node_id.to_string()).or_insert(NodeLedger {
            capacity_mb,
            allocated_mb: 0,
        });
        if entry.allocated_mb > capacity_mb {
            warn!(
                %node_id,
                capacity_mb,
                allocated_mb = entry.allocated_mb,
                "new capacity is below current allocation"
            );
        }
        entry.capacity_mb = capacity_mb;
    }

    pub fn remove_node(&self, node_id: &str) -> Option<NodeLedger> {
        self.lock().remove(node_id)
    }

    /// Reserve `mb` on `node_id` if it fits.
    ///
    /// Check and increment happen under one lock acquisition. Unknown nodes
    /// never accept allocations.
    pub fn try_allocate(&self, node_id: &str, mb: u64) -> bool {
        let mut nodes = self.lock();
        let Some(entry) = nodes.get_mut(node_id) else {
            debug!(%node_id, mb, "allocation refused: node not in ledger");
            return false;
        };
        match entry.allocated_mb.checked_add(mb) {
            Some(next) if next <= entry.capacity_mb => {
                entry.allocated_mb = next;
                debug!(%node_id, mb, allocated_mb = next, capacity_mb = entry.capacity_mb, "ram allocated");
                true
            }
            _ => {
                debug!(
                    %node_id,
                    mb,
                    allocated_mb = entry.allocated_mb,
                    capacity_mb = entry.capacity_mb,
                    "allocation refused: insufficient capacity"
                );
                false
            }
        }
    }

    /// Return `mb` to `node_id`, flooring at zero.
    pub fn release(&self, node_id: &str, mb: u64) {
        let mut nodes = self.lock();
        let Some(entry) = nodes.get_mut(node_id) else {
            warn!(%node_id, mb, "release for node not in ledger");
            return;
        };
        if mb > entry.allocated_mb {
            warn!(
                %node_id,
                mb,
                allocated_mb = entry.allocated_mb,
                "release exceeds allocation, flooring at zero"
            );
        }
        entry.allocated_mb = entry.allocated_mb.saturating_sub(mb);
        debug!(%node_id, mb, allocated_mb = entry.allocated_mb, "ram released");
    }

    pub fn usage(&self, node_id: &str) -> Option<NodeLedger> {
        self.lock().get(node_id).copied()
    }

    pub fn allocated_mb(&self, node_id: &str) -> u64 {
        self.usage(node_id).map(|u| u.allocated_mb).unwrap_or(0)
    }

    /// Point-in-time copy of every node's ledger entry.
    pub fn snapshot(&self) -> HashMap<NodeId, NodeLedger> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, NodeLedger>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock is still safe to use.
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use hearthgrid_state::*;

    #[test]
    fn allocate_within_capacity() {
        let ledger = ResourceLedger::new();
        ledger.register_node("n1", 8192);

        assert!(ledger.try_allocate("n1", 4096));
        assert!(ledger.try_allocate("n1", 4096));
        assert!(!ledger.try_allocate("n1", 1));
        assert_eq!(ledger.allocated_mb("n1"), 8192);
    }

    #[test]
    fn refused_allocation_leaves_ledger_unchanged() {
        let ledger = ResourceLedger::new();
        ledger.register_node("n1", 6144);

        assert!(ledger.try_allocate("n1", 4096));
        assert!(!ledger.try_allocate("n1", 4096));
        assert_eq!(ledger.allocated_mb("n1"), 4096);
    }

    #[test]
    fn unknown_node_refuses_allocation() {
        let ledger = ResourceLedger::new();
        assert!(!ledger.try_allocate("ghost", 1));
        assert_eq!(ledger.usage("ghost"), None);
    }

    #[test]
    fn release_floors_at_zero() {
        let ledger = ResourceLedger::new();
        ledger.register_node("n1", 8192);
        assert!(ledger.try_allocate("n1", 1024));

        ledger.release("n1", 1024);
        ledger.release("n1", 1024);
        assert_eq!(ledger.allocated_mb("n1"), 0);
    }

    #[test]
    fn overflowing_request_is_refused() {
        let ledger = ResourceLedger::new();
        ledger.register_node("n1", u64::MAX);
        assert!(ledger.try_allocate("n1", 10));
        assert!(!ledger.try_allocate("n1", u64::MAX));
        assert_eq!(ledger.allocated_mb("n1"), 10);
    }

    #[test]
    fn reregister_keeps_allocation() {
        let ledger = ResourceLedger::new();
        ledger.register_node("n1", 8192);
        assert!(ledger.try_allocate("n1", 2048));

        ledger.register_node("n1", 16384);
        let usage = ledger.usage("n1").unwrap();
        assert_eq!(usage.capacity_mb, 16384);
        assert_eq!(usage.allocated_mb, 2048);
        assert_eq!(usage.free_mb(), 14336);
    }

    #[test]
    fn concurrent_allocations_never_exceed_capacity() {
        let ledger = Arc::new(ResourceLedger::new());
        ledger.register_node("n1", 10_000);
        let granted = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let granted = Arc::clone(&granted);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if ledger.try_allocate("n1", 300) {
                            granted.fetch_add(300, Ordering::SeqCst);
                            let usage = ledger.usage("n1").unwrap();
                            assert!(usage.allocated_mb <= usage.capacity_mb);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let allocated = ledger.allocated_mb("n1");
        assert!(allocated <= 10_000);
        assert_eq!(allocated, granted.load(Ordering::SeqCst));
        assert_eq!(allocated, 9_900);
    }

    #[test]
    fn concurrent_allocate_and_release_net_out() {
        let ledger = Arc::new(ResourceLedger::new());
        ledger.register_node("n1", 4096);
        let net = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let net = Arc::clone(&net);
                std::thread::spawn(move || {
                    for round in 0..200 {
                        if ledger.try_allocate("n1", 512) {
                            // Odd threads keep every other grant.
                            if i % 2 == 1 && round % 2 == 0 {
                                net.fetch_add(512, Ordering::SeqCst);
                            } else {
                                ledger.release("n1", 512);
                            }
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(ledger.allocated_mb("n1"), net.load(Ordering::SeqCst));
        assert!(ledger.allocated_mb("n1") <= 4096);
    }

    fn node(id: &str, capacity: u64) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            address: "10.0.0.1".to_string(),
            transport: NodeTransport::Local,
            role: NodeRole::Worker,
            healthy: true,
            capacity_ram_mb: capacity,
            ram_overhead_factor: 1.0,
            cost_per_gb_hour: 0.01,
            labels: Map::new(),
            last_heartbeat: 0,
        }
    }

    fn workload(id: &str, node_id: &str, status: WorkloadStatus, ram: u64) -> WorkloadRecord {
        WorkloadRecord {
            id: id.to_string(),
            owner_id: "owner".to_string(),
            name: id.to_string(),
            image: "img".to_string(),
            port: 25565,
            data_path: format!("/srv/{id}"),
            booked_ram_mb: ram,
            granted_ram_mb: ram,
            status,
            node_id: Some(node_id.to_string()),
            container_id: Some(format!("ctr-{id}")),
            snapshot_id: None,
            env: Map::new(),
            occupants: 0,
            migration: MigrationPrefs::default(),
            last_started_at: None,
            last_stopped_at: None,
            last_error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn rebuild_charges_resource_holding_workloads() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&node("n1", 8192)).unwrap();
        store.put_node(&node("n2", 8192)).unwrap();
        store.put_workload(&workload("a", "n1", WorkloadStatus::Running, 2048)).unwrap();
        store.put_workload(&workload("b", "n1", WorkloadStatus::Starting, 1024)).unwrap();
        store.put_workload(&workload("c", "n2", WorkloadStatus::Stopped, 4096)).unwrap();
        store.put_workload(&workload("d", "n2", WorkloadStatus::Error, 512)).unwrap();

        let (ledger, report) = ResourceLedger::rebuild(&store).unwrap();

        assert_eq!(report.nodes, 2);
        assert_eq!(ledger.allocated_mb("n1"), 3072);
        // Stopped does not hold RAM; the errored one still has a container.
        assert_eq!(ledger.allocated_mb("n2"), 512);
        assert!(report.rejected.is_empty());
    }

    #[test]
    fn rebuild_reports_overcommit() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&node("n1", 4096)).unwrap();
        store.put_workload(&workload("a", "n1", WorkloadStatus::Running, 4096)).unwrap();
        store.put_workload(&workload("b", "n1", WorkloadStatus::Running, 4096)).unwrap();

        let (ledger, report) = ResourceLedger::rebuild(&store).unwrap();

        assert_eq!(ledger.allocated_mb("n1"), 4096);
        assert_eq!(report.charged.len(), 1);
        assert_eq!(report.rejected.len(), 1);
    }
}
