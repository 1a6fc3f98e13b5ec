//! Daemon assembly: opens the store, reconciles state left by the
//! previous process and runs the background loops.
//!
//! Startup order matters:
//! 1. Open the state store and upsert seed nodes
//! 2. Rebuild the RAM ledger from persisted workloads
//! 3. Recover interrupted lifecycle operations, then migrations
//! 4. Spawn the queue poller, migration poller and cost advisor

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use hearthgrid_migrate::{CostAdvisor, MigrationOrchestrator};
use hearthgrid_placement::{NodeSelector, ResourceLedger};
use hearthgrid_scheduler::{
    BootAdmissionController, BroadcastEventSink, LifecycleEvent, Runtimes, StartQueue,
    StoreRoutes, SystemLoadProbe, WorkloadLifecycleController,
};
use hearthgrid_state::StateStore;

use crate::config::HearthConfig;
use crate::docker::DockerRuntime;
use crate::shell::NodeShell;
use crate::transfer::{RsyncTransfer, SnapshotUnarchiver};

/// The wired-up control plane.
pub struct Daemon {
    pub lifecycle: Arc<WorkloadLifecycleController>,
    pub migrations: Arc<MigrationOrchestrator>,
    pub events: Arc<BroadcastEventSink>,
}

/// Open the store under `config.daemon.data_dir` and build every component.
pub async fn assemble(config: &HearthConfig) -> anyhow::Result<Daemon> {
    std::fs::create_dir_all(&config.daemon.data_dir)?;
    let db_path = config.daemon.data_dir.join("hearthgrid.redb");
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    build(state, config).await
}

/// Build the control plane on an already-open store.
pub async fn build(state: StateStore, config: &HearthConfig) -> anyhow::Result<Daemon> {
    for node in &config.nodes {
        let mut info = node.to_node_info()?;
        if let Some(existing) = state.get_node(&info.id)? {
            info.healthy = existing.healthy;
        }
        state.put_node(&info)?;
    }
    info!(nodes = config.nodes.len(), "seed nodes upserted");

    let (ledger, rebuilt) = ResourceLedger::rebuild(&state)?;
    let ledger = Arc::new(ledger);
    info!(?rebuilt, "resource ledger rebuilt");

    // ── Initialize subsystems ──────────────────────────────────

    let shell = NodeShell::new(&config.runtime.ssh_bin);
    let local = Arc::new(DockerRuntime::new(
        "docker-local",
        shell.clone(),
        &config.runtime.docker_bin,
        &config.runtime.image_default,
    ));
    let remote = Arc::new(DockerRuntime::new(
        "docker-ssh",
        shell.clone(),
        &config.runtime.docker_bin,
        &config.runtime.image_default,
    ));
    let transfer = RsyncTransfer::new(
        shell,
        &config.runtime.ssh_bin,
        &config.runtime.rsync_bin,
        &config.runtime.snapshot_dir,
    );
    let events = Arc::new(BroadcastEventSink::new(256));

    let boot = Arc::new(BootAdmissionController::with_probe(
        config.boot_config(),
        Box::new(SystemLoadProbe::new()),
    ));
    let selector = NodeSelector::new(state.clone(), Arc::clone(&ledger))
        .with_strategy(config.daemon.placement_strategy);
    let lifecycle = Arc::new(
        WorkloadLifecycleController::new(
            state.clone(),
            Arc::clone(&ledger),
            boot,
            Arc::new(StartQueue::new()),
            Runtimes::new(local, remote),
        )
        .with_selector(selector)
        .with_routes(Arc::new(StoreRoutes::new(state.clone())))
        .with_events(events.clone())
        .with_unarchiver(Arc::new(SnapshotUnarchiver::new(state, transfer.clone())))
        .with_config(config.lifecycle_config()),
    );
    let migrations = Arc::new(
        MigrationOrchestrator::new(Arc::clone(&lifecycle), Arc::new(transfer))
            .with_config(config.migration_config()),
    );

    // ── Recover interrupted work ───────────────────────────────

    let recovered = lifecycle.recover().await?;
    info!(?recovered, "lifecycle state recovered");
    let resumed = migrations.recover().await?;
    info!(?resumed, "migrations recovered");

    Ok(Daemon {
        lifecycle,
        migrations,
        events,
    })
}

/// Run the background loops until Ctrl-C.
pub async fn run(config: HearthConfig) -> anyhow::Result<()> {
    info!("HearthGrid daemon starting");
    let daemon = assemble(&config).await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let queue_handle = tokio::spawn(Arc::clone(&daemon.lifecycle).run_queue_poller(
        Duration::from_secs(config.daemon.queue_poll_secs),
        shutdown_rx.clone(),
    ));
    let migration_handle = tokio::spawn(Arc::clone(&daemon.migrations).run(
        Duration::from_secs(config.daemon.migration_poll_secs),
        shutdown_rx.clone(),
    ));
    let advisor = CostAdvisor::new(Arc::clone(&daemon.migrations));
    let advisor_handle = tokio::spawn(advisor.run(
        Duration::from_secs(config.daemon.advisor_interval_secs),
        shutdown_rx.clone(),
    ));
    let audit_handle = tokio::spawn(log_failures(daemon.events.subscribe(), shutdown_rx));

    // Kick off anything recovery left queued.
    if !daemon.lifecycle.queue().is_empty() {
        daemon.lifecycle.trigger_queue_processing();
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = queue_handle.await;
    let _ = migration_handle.await;
    let _ = advisor_handle.await;
    let _ = audit_handle.await;

    info!("HearthGrid daemon stopped");
    Ok(())
}

/// Surface failure events at warn level.
async fn log_failures(
    mut events: tokio::sync::broadcast::Receiver<LifecycleEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event @ (LifecycleEvent::StartFailed { .. }
                    | LifecycleEvent::StopFailed { .. }
                    | LifecycleEvent::MigrationFailed { .. })) => {
                    tracing::warn!(?event, "operation failed");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event listener lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_and_recovers_on_a_fresh_store() {
        let config: HearthConfig = toml::from_str(
            r#"
[[nodes]]
id = "w1"
address = "w1.example.net"
capacity_ram_mb = 16384
"#,
        )
        .unwrap();
        let state = StateStore::open_in_memory().unwrap();

        let daemon = build(state.clone(), &config).await.unwrap();

        assert_eq!(daemon.lifecycle.ledger().usage("w1").unwrap().capacity_mb, 16384);
        assert!(daemon.lifecycle.queue().is_empty());
        assert!(state.get_node("w1").unwrap().unwrap().healthy);
    }

    #[tokio::test]
    async fn seeding_keeps_recorded_health() {
        let config: HearthConfig = toml::from_str(
            r#"
[[nodes]]
id = "w1"
address = "w1.example.net"
capacity_ram_mb = 8192
"#,
        )
        .unwrap();
        let state = StateStore::open_in_memory().unwrap();
        build(state.clone(), &config).await.unwrap();
        state.set_node_health("w1", false).unwrap();

        build(state.clone(), &config).await.unwrap();

        assert!(!state.get_node("w1").unwrap().unwrap().healthy);
    }
}
