//! Lifecycle event fan-out.
//!
//! Events are fire-and-forget: emitting never fails or blocks the
//! operation that produced it.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use hearthgrid_state::{MigrationStatus, WorkloadStatus};

use crate::error::QueueReason;

/// Something observable happened to a workload or migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Queued {
        workload_id: String,
        reason: QueueReason,
    },
    Starting {
        workload_id: String,
        node_id: String,
    },
    Started {
        workload_id: String,
        node_id: String,
        /// False when the readiness wait timed out.
        ready: bool,
    },
    StartFailed {
        workload_id: String,
        error: String,
    },
    Stopping {
        workload_id: String,
    },
    Stopped {
        workload_id: String,
        status: WorkloadStatus,
    },
    StopFailed {
        workload_id: String,
        error: String,
    },
    MigrationPhase {
        migration_id: String,
        workload_id: String,
        status: MigrationStatus,
    },
    MigrationWarning {
        migration_id: String,
        message: String,
    },
    MigrationFailed {
        migration_id: String,
        error: String,
        will_retry: bool,
    },
}

/// Receives lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: LifecycleEvent) {
        info!(event = ?event, "lifecycle event");
    }
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lose the oldest events; emitting with no subscriber is
/// a no-op.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();

        sink.emit(LifecycleEvent::Stopping {
            workload_id: "w1".to_string(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            LifecycleEvent::Stopping {
                workload_id: "w1".to_string()
            }
        );
    }

    #[test]
    fn broadcast_without_subscribers_is_silent() {
        let sink = BroadcastEventSink::new(1);
        sink.emit(LifecycleEvent::StartFailed {
            workload_id: "w1".to_string(),
            error: "boom".to_string(),
        });
    }
}
