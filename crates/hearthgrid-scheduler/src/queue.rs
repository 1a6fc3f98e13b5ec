//! Start queue: FIFO backpressure for start requests.
//!
//! A workload lands here when admission fails for a transient reason
//! (boot slot busy, host load, no room). The lifecycle controller drains
//! the queue whenever capacity may have freed up; only one drain runs at a
//! time, and a drain requested while another is in flight triggers one
//! more pass when it finishes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use hearthgrid_state::{OwnerId, WorkloadId, epoch_secs};

use crate::error::QueueReason;

/// A start request waiting for capacity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub workload_id: WorkloadId,
    pub owner_id: OwnerId,
    pub required_ram_mb: u64,
    /// Unix time the request entered the queue.
    pub enqueued_at: u64,
    /// Why it was queued most recently.
    pub reason: QueueReason,
}

/// FIFO of pending start requests, at most one entry per workload.
#[derive(Debug, Default)]
pub struct StartQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    draining: AtomicBool,
    rerun: AtomicBool,
}

/// Exclusive right to drain the queue; released on drop.
#[must_use]
pub struct DrainGuard<'a> {
    queue: &'a StartQueue,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.queue.draining.store(false, Ordering::SeqCst);
    }
}

impl StartQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request. A workload already queued keeps its position;
    /// only its reason is refreshed. Returns true if a new entry was added.
    pub fn enqueue(
        &self,
        workload_id: &str,
        owner_id: &str,
        required_ram_mb: u64,
        reason: QueueReason,
    ) -> bool {
        let mut entries = self.lock();
        if let Some(existing) = entries.iter_mut().find(|e| e.workload_id == workload_id) {
            existing.reason = reason;
            return false;
        }
        entries.push_back(QueueEntry {
            workload_id: workload_id.to_string(),
            owner_id: owner_id.to_string(),
            required_ram_mb,
            enqueued_at: epoch_secs(),
            reason,
        });
        debug!(workload_id, %reason, depth = entries.len(), "workload enqueued");
        true
    }

    /// Re-insert a recovered entry at the back, keeping its original time.
    pub fn restore(&self, entry: QueueEntry) -> bool {
        let mut entries = self.lock();
        if entries.iter().any(|e| e.workload_id == entry.workload_id) {
            return false;
        }
        entries.push_back(entry);
        true
    }

    pub fn remove(&self, workload_id: &str) -> Option<QueueEntry> {
        let mut entries = self.lock();
        let index = entries.iter().position(|e| e.workload_id == workload_id)?;
        entries.remove(index)
    }

    pub fn is_queued(&self, workload_id: &str) -> bool {
        self.position(workload_id).is_some()
    }

    /// Zero-based position of `workload_id`, front first.
    pub fn position(&self, workload_id: &str) -> Option<usize> {
        self.lock().iter().position(|e| e.workload_id == workload_id)
    }

    /// Snapshot of all entries in FIFO order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Claim the drain. Returns `None` if a drain is already running, in
    /// which case that drain is asked to run one more pass.
    pub fn begin_drain(&self) -> Option<DrainGuard<'_>> {
        loop {
            if !self.draining.swap(true, Ordering::SeqCst) {
                // The pass about to run covers any request made so far.
                self.rerun.store(false, Ordering::SeqCst);
                return Some(DrainGuard { queue: self });
            }
            self.rerun.store(true, Ordering::SeqCst);
            // A drainer that let go after our swap may already have checked
            // for reruns; claim the drain ourselves in that case.
            if self.draining.load(Ordering::SeqCst) {
                return None;
            }
        }
    }

    /// Consume a pending rerun request. Call after dropping the guard.
    pub fn take_rerun(&self) -> bool {
        self.rerun.swap(false, Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
