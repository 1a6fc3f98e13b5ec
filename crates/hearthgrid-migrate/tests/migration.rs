//! End-to-end migration tests against in-memory collaborators.
//!
//! Covers live and data-only moves, Preparing rollback with bounded retry,
//! the one-active-migration rule, suggestion approval and restart recovery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use hearthgrid_migrate::*;
use hearthgrid_scheduler::testing::{
    Harness, control_plane_node, local_worker_node, worker_node, workload,
};
use hearthgrid_scheduler::{
    ContainerRuntime, ContainerSpec, LifecycleEvent, SchedulerError, StopReason,
};
use hearthgrid_state::*;

#[derive(Debug, Clone, PartialEq)]
enum TransferCall {
    Sync { from: String, to: String, path: String },
    Restore { snapshot: String, to: String, path: String },
}

#[derive(Default)]
struct FakeTransfer {
    calls: Mutex<Vec<TransferCall>>,
    failing: Mutex<bool>,
}

impl FakeTransfer {
    fn calls(&self) -> Vec<TransferCall> {
        self.calls.lock().unwrap().clone()
    }

    fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl DataTransfer for FakeTransfer {
    async fn sync_directory(
        &self,
        source: &NodeInfo,
        target: &NodeInfo,
        path: &str,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(TransferCall::Sync {
            from: source.id.clone(),
            to: target.id.clone(),
            path: path.to_string(),
        });
        if *self.failing.lock().unwrap() {
            bail!("rsync exited with status 23");
        }
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        snapshot_id: &str,
        target: &NodeInfo,
        path: &str,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(TransferCall::Restore {
            snapshot: snapshot_id.to_string(),
            to: target.id.clone(),
            path: path.to_string(),
        });
        if *self.failing.lock().unwrap() {
            bail!("snapshot not found");
        }
        Ok(())
    }
}

struct Fleet {
    h: Harness,
    transfer: Arc<FakeTransfer>,
    orchestrator: Arc<MigrationOrchestrator>,
}

fn test_config() -> MigrationConfig {
    MigrationConfig {
        max_retries: 2,
        min_dwell: Duration::ZERO,
        retry_backoff: Duration::ZERO,
        ready_timeout: Duration::from_secs(2),
    }
}

fn fleet(nodes: &[NodeInfo]) -> Fleet {
    let h = Harness::new(nodes);
    let transfer = Arc::new(FakeTransfer::default());
    let orchestrator = Arc::new(
        MigrationOrchestrator::new(Arc::clone(&h.controller), transfer.clone())
            .with_config(test_config()),
    );
    Fleet {
        h,
        transfer,
        orchestrator,
    }
}

/// Two equal workers; best-fit tie-breaking starts workloads on "a".
fn two_workers() -> Fleet {
    fleet(&[worker_node("a", 8192), worker_node("b", 8192)])
}

async fn running_on_a(f: &Fleet, id: &str) -> WorkloadRecord {
    f.h.add_workload(&workload(id, 4096));
    let w = f.h.controller.start_workload(id).await.unwrap();
    assert_eq!(w.node_id.as_deref(), Some("a"));
    w
}

fn stopped_on(f: &Fleet, id: &str, node: &str) {
    let mut w = workload(id, 4096);
    w.node_id = Some(node.to_string());
    f.h.add_workload(&w);
}

fn migration(f: &Fleet, id: &str) -> MigrationRecord {
    f.h.state.get_migration(id).unwrap().unwrap()
}

// ── Live migration ────────────────────────────────────────────────

#[tokio::test]
async fn live_migration_moves_workload_to_target() {
    let f = two_workers();
    let before = running_on_a(&f, "w1").await;
    let source_container = before.container_id.clone().unwrap();

    let scheduled = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();
    assert_eq!(scheduled.status, MigrationStatus::Scheduled);
    assert_eq!(scheduled.source_node_id, "a");

    let done = f.orchestrator.execute_migration(&scheduled.id).await.unwrap();

    assert_eq!(done.status, MigrationStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.warnings.is_empty());
    assert_eq!(done.source_container_id.as_deref(), Some(source_container.as_str()));

    let w = f.h.workload("w1");
    assert_eq!(w.status, WorkloadStatus::Running);
    assert_eq!(w.node_id.as_deref(), Some("b"));
    assert_eq!(w.container_id, done.target_container_id);
    assert_eq!(f.h.ledger.allocated_mb("a"), 0);
    assert_eq!(f.h.ledger.allocated_mb("b"), 4096);
    assert!(f.h.runtime.containers_on("a").is_empty());
    assert_eq!(f.h.runtime.containers_on("b").len(), 1);
    assert_eq!(
        f.h.routes.address_of("w1.play").as_deref(),
        Some("b.fleet.internal:25565")
    );
    assert_eq!(
        f.transfer.calls(),
        vec![TransferCall::Sync {
            from: "a".to_string(),
            to: "b".to_string(),
            path: "/srv/hearth/w1".to_string(),
        }]
    );

    let phases: Vec<MigrationStatus> = f
        .h
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            LifecycleEvent::MigrationPhase { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            MigrationStatus::Scheduled,
            MigrationStatus::Preparing,
            MigrationStatus::Transferring,
            MigrationStatus::Completing,
            MigrationStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn selector_picks_a_target_other_than_the_source() {
    let f = two_workers();
    running_on_a(&f, "w1").await;

    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1"))
        .unwrap();
    assert!(!m.target_pinned);

    let done = f.orchestrator.execute_migration(&m.id).await.unwrap();
    assert_eq!(done.target_node_id.as_deref(), Some("b"));
    assert_eq!(f.h.workload("w1").node_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn container_start_failure_on_target_rolls_back_and_retries() {
    let f = two_workers();
    running_on_a(&f, "w1").await;
    f.h.runtime.fail_start_on("b");
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();

    let err = f.orchestrator.execute_migration(&m.id).await.unwrap_err();

    assert!(matches!(
        err,
        MigrateError::PhaseFailed { phase: MigrationStatus::Preparing, .. }
    ));
    assert_eq!(f.h.ledger.allocated_mb("b"), 0);
    assert!(f.h.runtime.containers_on("b").is_empty());

    let after = migration(&f, &m.id);
    assert_eq!(after.status, MigrationStatus::Scheduled);
    assert_eq!(after.retry_count, 1);
    assert!(after.last_error.is_some());
    assert!(after.target_container_id.is_none());
    assert_eq!(after.target_node_id.as_deref(), Some("b"));
    assert_eq!(
        f.h.events.count(|e| matches!(
            e,
            LifecycleEvent::MigrationFailed { will_retry: true, .. }
        )),
        1
    );

    // The source is untouched.
    let w = f.h.workload("w1");
    assert_eq!(w.status, WorkloadStatus::Running);
    assert_eq!(w.node_id.as_deref(), Some("a"));
    assert_eq!(f.h.ledger.allocated_mb("a"), 4096);
    assert_eq!(f.h.runtime.containers_on("a").len(), 1);
    assert_eq!(
        f.h.routes.address_of("w1.play").as_deref(),
        Some("a.fleet.internal:25565")
    );
}

#[tokio::test]
async fn retries_stop_once_the_budget_is_spent() {
    let f = two_workers();
    running_on_a(&f, "w1").await;
    f.h.runtime.fail_create_on("b");
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();

    assert!(f.orchestrator.execute_migration(&m.id).await.is_err());
    assert!(f.orchestrator.execute_migration(&m.id).await.is_err());

    let after = migration(&f, &m.id);
    assert_eq!(after.status, MigrationStatus::Failed);
    assert_eq!(after.retry_count, 2);
    assert!(matches!(
        f.orchestrator.execute_migration(&m.id).await.unwrap_err(),
        MigrateError::IllegalTransition { from: MigrationStatus::Failed, .. }
    ));
    assert_eq!(f.h.ledger.allocated_mb("b"), 0);

    // A spent migration no longer blocks new ones.
    f.h.runtime.clear_failures();
    let next = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();
    f.orchestrator.execute_migration(&next.id).await.unwrap();
    assert_eq!(f.h.workload("w1").node_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn readiness_failure_on_target_is_a_preparing_failure() {
    let f = two_workers();
    running_on_a(&f, "w1").await;
    f.h.runtime.fail_ready_on("b");
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();

    assert!(f.orchestrator.execute_migration(&m.id).await.is_err());

    assert_eq!(f.h.ledger.allocated_mb("b"), 0);
    assert!(f.h.runtime.containers_on("b").is_empty());
    assert_eq!(f.h.workload("w1").node_id.as_deref(), Some("a"));
}

#[tokio::test]
async fn transfer_failure_releases_target_ram() {
    let f = two_workers();
    running_on_a(&f, "w1").await;
    f.transfer.set_failing(true);
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();

    assert!(f.orchestrator.execute_migration(&m.id).await.is_err());

    assert_eq!(f.h.ledger.allocated_mb("b"), 0);
    assert_eq!(f.h.runtime.container_count(), 1);
    assert_eq!(migration(&f, &m.id).retry_count, 1);
}

#[tokio::test]
async fn target_without_room_fails_preparing() {
    let f = fleet(&[worker_node("a", 8192), worker_node("b", 2048)]);
    f.h.add_workload(&workload("w1", 4096));
    f.h.controller.start_workload("w1").await.unwrap();
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();

    assert!(f.orchestrator.execute_migration(&m.id).await.is_err());

    assert_eq!(f.h.ledger.allocated_mb("b"), 0);
    assert!(f.transfer.calls().is_empty());
}

#[tokio::test]
async fn source_cleanup_failure_completes_with_warning() {
    let f = two_workers();
    running_on_a(&f, "w1").await;
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();
    f.h.runtime.set_fail_stop(true);
    f.h.routes.set_failing(true);

    let done = f.orchestrator.execute_migration(&m.id).await.unwrap();

    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(done.warnings.len(), 2);
    assert_eq!(f.h.workload("w1").node_id.as_deref(), Some("b"));
    assert_eq!(f.h.ledger.allocated_mb("a"), 0);
    assert_eq!(
        f.h.events
            .count(|e| matches!(e, LifecycleEvent::MigrationWarning { .. })),
        2
    );
}

/// Run `migration_id` on its own task, held at target readiness until the
/// runtime's ready gate opens.
async fn held_at_target_readiness(
    f: &Fleet,
    migration_id: &str,
) -> tokio::task::JoinHandle<MigrateResult<MigrationRecord>> {
    f.h.runtime.close_ready_gate();
    let orchestrator = Arc::clone(&f.orchestrator);
    let id = migration_id.to_string();
    let task = tokio::spawn(async move { orchestrator.execute_migration(&id).await });
    f.h.wait_until("target container on b", |h| {
        !h.runtime.containers_on("b").is_empty()
    })
    .await;
    task
}

#[tokio::test]
async fn stop_is_refused_while_live_migration_prepares() {
    let f = two_workers();
    running_on_a(&f, "w1").await;
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();
    let task = held_at_target_readiness(&f, &m.id).await;

    let err = f
        .h
        .controller
        .stop_workload("w1", StopReason::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::MigrationInProgress { .. }));

    f.h.runtime.open_ready_gate();
    let done = task.await.unwrap().unwrap();

    assert_eq!(done.status, MigrationStatus::Completed);
    assert!(done.warnings.is_empty(), "{:?}", done.warnings);
    let w = f.h.workload("w1");
    assert_eq!(w.status, WorkloadStatus::Running);
    assert_eq!(w.node_id.as_deref(), Some("b"));
    assert_eq!(
        f.h.routes.address_of("w1.play").as_deref(),
        Some("b.fleet.internal:25565")
    );
}

#[tokio::test]
async fn workload_leaving_running_mid_migration_keeps_no_stale_route() {
    let f = two_workers();
    running_on_a(&f, "w1").await;
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();
    let task = held_at_target_readiness(&f, &m.id).await;

    f.h.state
        .update_workload("w1", |w| w.status = WorkloadStatus::Stopped)
        .unwrap();
    f.h.runtime.open_ready_gate();
    let done = task.await.unwrap().unwrap();

    assert_eq!(done.status, MigrationStatus::Completed);
    assert!(
        done.warnings.iter().any(|w| w.contains("target released")),
        "{:?}",
        done.warnings
    );
    let w = f.h.workload("w1");
    assert_eq!(w.node_id.as_deref(), Some("a"));
    assert!(f.h.runtime.containers_on("b").is_empty());
    assert_eq!(f.h.ledger.allocated_mb("b"), 0);
    assert!(f.h.routes.address_of("w1.play").is_none());
}

// ── Data-only migration ───────────────────────────────────────────

#[tokio::test]
async fn stopped_workload_moves_data_only() {
    let f = two_workers();
    stopped_on(&f, "w1", "a");

    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();
    let done = f.orchestrator.execute_migration(&m.id).await.unwrap();

    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(done.target_ram_mb, 0);
    assert!(done.target_container_id.is_none());
    let w = f.h.workload("w1");
    assert_eq!(w.status, WorkloadStatus::Stopped);
    assert_eq!(w.node_id.as_deref(), Some("b"));
    assert_eq!(f.h.runtime.container_count(), 0);
    assert_eq!(f.h.ledger.allocated_mb("b"), 0);
    assert!(f.h.routes.address_of("w1.play").is_none());
    assert_eq!(f.transfer.calls().len(), 1);
}

#[tokio::test]
async fn control_plane_source_restores_from_snapshot() {
    let f = fleet(&[control_plane_node("cp", 65536), worker_node("b", 8192)]);
    let mut w = workload("w1", 4096);
    w.node_id = Some("cp".to_string());
    w.snapshot_id = Some("snap-7".to_string());
    f.h.add_workload(&w);

    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1"))
        .unwrap();
    f.orchestrator.execute_migration(&m.id).await.unwrap();

    assert_eq!(
        f.transfer.calls(),
        vec![TransferCall::Restore {
            snapshot: "snap-7".to_string(),
            to: "b".to_string(),
            path: "/srv/hearth/w1".to_string(),
        }]
    );
    assert_eq!(f.h.workload("w1").node_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn restart_after_data_only_move_lands_on_new_home() {
    let f = two_workers();
    stopped_on(&f, "w1", "a");
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap();
    f.orchestrator.execute_migration(&m.id).await.unwrap();

    // Without a home node the best-fit tie would go to "a".
    let running = f.h.controller.start_workload("w1").await.unwrap();
    assert_eq!(running.node_id.as_deref(), Some("b"));
    assert_eq!(f.h.ledger.allocated_mb("b"), 4096);
}

// ── Admission ─────────────────────────────────────────────────────

#[tokio::test]
async fn only_one_active_migration_per_workload() {
    let f = two_workers();
    running_on_a(&f, "w1").await;

    let first = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1"))
        .unwrap();
    let err = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1"))
        .unwrap_err();
    assert!(matches!(err, MigrateError::AlreadyActive(_)));

    f.orchestrator.cancel_migration(&first.id).unwrap();
    assert!(
        f.orchestrator
            .schedule_migration(MigrationRequest::manual("w1"))
            .is_ok()
    );
}

#[tokio::test]
async fn invalid_targets_are_rejected() {
    let f = fleet(&[
        worker_node("a", 8192),
        control_plane_node("cp", 65536),
    ]);
    running_on_a(&f, "w1").await;

    for target in ["a", "cp", "missing"] {
        let err = f
            .orchestrator
            .schedule_migration(MigrationRequest::manual("w1").with_target(target))
            .unwrap_err();
        assert!(matches!(err, MigrateError::InvalidTarget(_)), "{target}");
    }
    assert!(f.h.state.list_migrations().unwrap().is_empty());
}

#[tokio::test]
async fn live_moves_between_control_plane_host_workers_are_rejected() {
    let f = fleet(&[local_worker_node("a", 8192), local_worker_node("b", 8192)]);
    running_on_a(&f, "w1").await;
    stopped_on(&f, "w2", "a");

    let err = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1").with_target("b"))
        .unwrap_err();
    assert!(matches!(err, MigrateError::InvalidTarget(ref t) if t == "b"));

    // Without a container on either side, only the data moves.
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w2").with_target("b"))
        .unwrap();
    let done = f.orchestrator.execute_migration(&m.id).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(f.h.workload("w2").node_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn unpinned_live_move_leaves_the_control_plane_host() {
    let f = fleet(&[
        local_worker_node("a", 8192),
        local_worker_node("b", 8192),
        worker_node("c", 16384),
    ]);
    running_on_a(&f, "w1").await;

    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1"))
        .unwrap();
    let done = f.orchestrator.execute_migration(&m.id).await.unwrap();

    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(done.target_node_id.as_deref(), Some("c"));
    assert!(f.h.runtime.containers_on("b").is_empty());
    assert_eq!(f.h.runtime.containers_on("c").len(), 1);
    assert_eq!(f.h.ledger.allocated_mb("b"), 0);
}

#[tokio::test]
async fn disallowed_and_homeless_workloads_are_not_eligible() {
    let f = two_workers();
    let mut locked = workload("locked", 1024);
    locked.node_id = Some("a".to_string());
    locked.migration.allow_migration = false;
    f.h.add_workload(&locked);
    f.h.add_workload(&workload("fresh", 1024));

    for id in ["locked", "fresh"] {
        let err = f
            .orchestrator
            .schedule_migration(MigrationRequest::manual(id))
            .unwrap_err();
        assert!(matches!(err, MigrateError::NotEligible { .. }), "{id}");
    }
    assert!(matches!(
        f.orchestrator
            .schedule_migration(MigrationRequest::manual("ghost"))
            .unwrap_err(),
        MigrateError::WorkloadNotFound(_)
    ));
}

#[tokio::test]
async fn occupied_workload_defers_cost_migration() {
    let f = two_workers();
    running_on_a(&f, "w1").await;
    f.h.state.update_workload("w1", |w| w.occupants = 3).unwrap();

    let m = f
        .orchestrator
        .schedule_migration(
            MigrationRequest::manual("w1")
                .with_target("b")
                .with_reason(MigrationReason::CostOptimization),
        )
        .unwrap();
    let err = f.orchestrator.execute_migration(&m.id).await.unwrap_err();

    assert!(matches!(err, MigrateError::NotEligible { .. }));
    let after = migration(&f, &m.id);
    assert_eq!(after.status, MigrationStatus::Scheduled);
    assert_eq!(after.retry_count, 0);
    assert_eq!(f.h.ledger.allocated_mb("b"), 0);
}

#[tokio::test]
async fn permanently_ineligible_migration_is_cancelled() {
    let f = two_workers();
    running_on_a(&f, "w1").await;
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1"))
        .unwrap();
    f.h.state
        .update_workload("w1", |w| w.migration.allow_migration = false)
        .unwrap();

    assert!(f.orchestrator.execute_migration(&m.id).await.is_err());

    let after = migration(&f, &m.id);
    assert_eq!(after.status, MigrationStatus::Cancelled);
    assert!(after.last_error.is_some());
}

// ── Suggestions ───────────────────────────────────────────────────

#[tokio::test]
async fn suggestion_runs_only_after_approval() {
    let f = two_workers();
    running_on_a(&f, "w1").await;

    let suggested = f
        .orchestrator
        .suggest_migration(MigrationRequest::manual("w1").with_target("b"), 12.5)
        .unwrap();
    assert_eq!(suggested.status, MigrationStatus::Suggested);
    assert_eq!(suggested.estimated_monthly_savings, 12.5);
    assert!(f.orchestrator.poll_due().unwrap().is_empty());
    assert!(matches!(
        f.orchestrator.execute_migration(&suggested.id).await.unwrap_err(),
        MigrateError::IllegalTransition { .. }
    ));

    let approved = f.orchestrator.approve_migration(&suggested.id, None).unwrap();
    assert_eq!(approved.status, MigrationStatus::Scheduled);

    for handle in f.orchestrator.poll_due().unwrap() {
        handle.await.unwrap();
    }
    assert_eq!(migration(&f, &suggested.id).status, MigrationStatus::Completed);
    assert_eq!(f.h.workload("w1").node_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn finished_migrations_cannot_be_cancelled() {
    let f = two_workers();
    stopped_on(&f, "w1", "a");
    let m = f
        .orchestrator
        .schedule_migration(MigrationRequest::manual("w1"))
        .unwrap();
    f.orchestrator.execute_migration(&m.id).await.unwrap();

    assert!(matches!(
        f.orchestrator.cancel_migration(&m.id).unwrap_err(),
        MigrateError::IllegalTransition { from: MigrationStatus::Completed, .. }
    ));
    assert!(matches!(
        f.orchestrator.cancel_migration("nope").unwrap_err(),
        MigrateError::MigrationNotFound(_)
    ));
}

#[tokio::test]
async fn future_migrations_are_not_due() {
    let f = two_workers();
    stopped_on(&f, "w1", "a");
    f.orchestrator
        .schedule_migration(MigrationRequest::manual("w1").at(epoch_secs() + 3600))
        .unwrap();

    assert!(f.orchestrator.poll_due().unwrap().is_empty());
}

// ── Recovery ──────────────────────────────────────────────────────

#[tokio::test]
async fn interrupted_preparing_is_rolled_back_on_recovery() {
    let f = two_workers();
    let w = running_on_a(&f, "w1").await;
    let target = f.h.state.get_node("b").unwrap().unwrap();
    let leftover = f
        .h
        .runtime
        .create(&target, &ContainerSpec::for_workload(&w, &target))
        .await
        .unwrap();

    let mut m = MigrationRecord::new(
        "m1",
        "w1",
        "a",
        None,
        MigrationReason::Manual,
        3,
        0,
        0,
    );
    m.status = MigrationStatus::Preparing;
    m.target_node_id = Some("b".to_string());
    m.target_ram_mb = 4096;
    m.target_container_id = Some(leftover.id.clone());
    f.h.state.put_migration(&m).unwrap();

    let report = f.orchestrator.recover().await.unwrap();

    assert_eq!(report, MigrationRecoveryReport { failed: 1, resumed: 0 });
    assert!(f.h.runtime.container(&leftover.id).is_none());
    assert_eq!(f.h.ledger.allocated_mb("b"), 0);
    let after = migration(&f, "m1");
    assert_eq!(after.status, MigrationStatus::Scheduled);
    assert_eq!(after.retry_count, 1);
    assert!(after.target_node_id.is_none());
}

#[tokio::test]
async fn interrupted_transfer_is_finished_on_recovery() {
    let f = two_workers();
    let w = running_on_a(&f, "w1").await;
    let target = f.h.state.get_node("b").unwrap().unwrap();
    let handle = f
        .h
        .runtime
        .create(&target, &ContainerSpec::for_workload(&w, &target))
        .await
        .unwrap();
    f.h.runtime.start(&target, &handle).await.unwrap();

    let mut m = MigrationRecord::new(
        "m1",
        "w1",
        "a",
        Some("b".to_string()),
        MigrationReason::Manual,
        3,
        0,
        0,
    );
    m.status = MigrationStatus::Transferring;
    m.target_ram_mb = 4096;
    m.source_container_id = w.container_id.clone();
    m.target_container_id = Some(handle.id.clone());
    f.h.state.put_migration(&m).unwrap();

    let report = f.orchestrator.recover().await.unwrap();

    assert_eq!(report, MigrationRecoveryReport { failed: 0, resumed: 1 });
    let after = migration(&f, "m1");
    assert_eq!(after.status, MigrationStatus::Completed);
    let moved = f.h.workload("w1");
    assert_eq!(moved.node_id.as_deref(), Some("b"));
    assert_eq!(moved.container_id.as_deref(), Some(handle.id.as_str()));
    assert_eq!(f.h.ledger.allocated_mb("a"), 0);
    assert_eq!(f.h.ledger.allocated_mb("b"), 4096);
    assert!(f.h.runtime.containers_on("a").is_empty());
    assert_eq!(
        f.h.routes.address_of("w1.play").as_deref(),
        Some("b.fleet.internal:25565")
    );
}
