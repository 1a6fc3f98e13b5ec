//! Migration orchestrator: runs migrations through their phases.
//!
//! Migrations are created `Scheduled` (or `Suggested`, awaiting approval)
//! and picked up by [`MigrationOrchestrator::poll_due`]. Each due migration
//! runs on its own task; the only shared state is the ledger and the
//! store's compare-and-set transitions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow, bail};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hearthgrid_scheduler::{
    ContainerHandle, ContainerSpec, LifecycleEvent, WorkloadLifecycleController, workload_address,
};
use hearthgrid_state::{
    MigrationId, MigrationReason, MigrationRecord, MigrationStatus, NodeId, NodeInfo, StateError,
    StateStore, Transition, WorkloadId, WorkloadRecord, WorkloadStatus, epoch_secs,
};

use crate::admission::{MigrationConfig, can_execute};
use crate::error::{MigrateError, MigrateResult};
use crate::machine;
use crate::transfer::{DataTransfer, TransferPlan, plan_transfer};

/// A request to move a workload.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub workload_id: WorkloadId,
    /// Explicit target. `None` lets the selector choose at execution time.
    pub target_node_id: Option<NodeId>,
    pub reason: MigrationReason,
    /// Earliest execution time; `None` means now.
    pub scheduled_at: Option<u64>,
}

impl MigrationRequest {
    pub fn manual(workload_id: impl Into<WorkloadId>) -> Self {
        Self {
            workload_id: workload_id.into(),
            target_node_id: None,
            reason: MigrationReason::Manual,
            scheduled_at: None,
        }
    }

    pub fn with_target(mut self, node_id: impl Into<NodeId>) -> Self {
        self.target_node_id = Some(node_id.into());
        self
    }

    pub fn with_reason(mut self, reason: MigrationReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn at(mut self, scheduled_at: u64) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}

/// What [`MigrationOrchestrator::recover`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationRecoveryReport {
    /// Interrupted in Preparing, rolled back and sent through the retry edge.
    pub failed: usize,
    /// Interrupted after the route switch and finished.
    pub resumed: usize,
}

/// Resources a Preparing attempt has acquired so far.
#[derive(Default)]
struct PartialTarget {
    node: Option<NodeInfo>,
    ram_mb: u64,
    handle: Option<ContainerHandle>,
}

/// Drives migrations through Preparing, Transferring and Completing.
pub struct MigrationOrchestrator {
    lifecycle: Arc<WorkloadLifecycleController>,
    transfer: Arc<dyn DataTransfer>,
    config: MigrationConfig,
    sequence: AtomicU64,
}

impl MigrationOrchestrator {
    pub fn new(lifecycle: Arc<WorkloadLifecycleController>, transfer: Arc<dyn DataTransfer>) -> Self {
        Self {
            lifecycle,
            transfer,
            config: MigrationConfig::default(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<WorkloadLifecycleController> {
        &self.lifecycle
    }

    fn state(&self) -> &StateStore {
        self.lifecycle.state()
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Record a `Scheduled` migration.
    ///
    /// Fails with `AlreadyActive` if the workload has another non-terminal
    /// migration. Conditions that clear by themselves (occupants, dwell
    /// time) are re-checked at execution instead of here.
    pub fn schedule_migration(&self, request: MigrationRequest) -> MigrateResult<MigrationRecord> {
        let record = self.build_record(&request, MigrationStatus::Scheduled, 0.0)?;
        self.insert(record)
    }

    /// Record a `Suggested` migration that runs only once approved.
    pub fn suggest_migration(
        &self,
        request: MigrationRequest,
        estimated_monthly_savings: f64,
    ) -> MigrateResult<MigrationRecord> {
        let record =
            self.build_record(&request, MigrationStatus::Suggested, estimated_monthly_savings)?;
        self.insert(record)
    }

    /// Approve a suggestion, making it due at `scheduled_at` (or now).
    pub fn approve_migration(
        &self,
        migration_id: &str,
        scheduled_at: Option<u64>,
    ) -> MigrateResult<MigrationRecord> {
        let due = scheduled_at.unwrap_or_else(epoch_secs);
        let m = machine::transition(
            self.state(),
            migration_id,
            &[MigrationStatus::Suggested],
            MigrationStatus::Scheduled,
            |m| m.scheduled_at = due,
        )?;
        info!(migration_id, workload_id = %m.workload_id, "migration approved");
        self.emit_phase(&m);
        Ok(m)
    }

    /// Cancel a migration that has not started yet.
    pub fn cancel_migration(&self, migration_id: &str) -> MigrateResult<MigrationRecord> {
        let m = machine::transition(
            self.state(),
            migration_id,
            &[MigrationStatus::Suggested, MigrationStatus::Scheduled],
            MigrationStatus::Cancelled,
            |m| m.completed_at = Some(epoch_secs()),
        )?;
        info!(migration_id, workload_id = %m.workload_id, "migration cancelled");
        self.emit_phase(&m);
        Ok(m)
    }

    fn build_record(
        &self,
        request: &MigrationRequest,
        status: MigrationStatus,
        savings: f64,
    ) -> MigrateResult<MigrationRecord> {
        let workload = self.load_workload(&request.workload_id)?;
        let now = epoch_secs();

        if let Err(ineligible) = can_execute(&workload, request.reason, now, &self.config) {
            if !ineligible.transient {
                return Err(MigrateError::NotEligible {
                    workload_id: workload.id,
                    reason: ineligible.reason,
                });
            }
        }
        let Some(source) = workload.node_id.clone() else {
            return Err(MigrateError::NotEligible {
                workload_id: workload.id,
                reason: "workload has no node".to_string(),
            });
        };

        if let Some(target) = &request.target_node_id {
            if *target == source {
                return Err(MigrateError::InvalidTarget(target.clone()));
            }
            if !self.lifecycle.selector().is_hostable(target)? {
                return Err(MigrateError::InvalidTarget(target.clone()));
            }
            if workload.status == WorkloadStatus::Running
                && self.share_host(&source, target)?
            {
                return Err(MigrateError::InvalidTarget(target.clone()));
            }
        }

        let mut record = MigrationRecord::new(
            self.next_id(&workload.id),
            workload.id,
            source,
            request.target_node_id.clone(),
            request.reason,
            self.config.max_retries,
            request.scheduled_at.unwrap_or(now),
            now,
        );
        record.status = status;
        record.estimated_monthly_savings = savings;
        Ok(record)
    }

    fn insert(&self, record: MigrationRecord) -> MigrateResult<MigrationRecord> {
        if !self.state().insert_migration_if_idle(&record)? {
            return Err(MigrateError::AlreadyActive(record.workload_id));
        }
        info!(
            migration_id = %record.id,
            workload_id = %record.workload_id,
            source = %record.source_node_id,
            target = ?record.target_node_id,
            status = %record.status,
            "migration recorded"
        );
        self.emit_phase(&record);
        Ok(record)
    }

    fn next_id(&self, workload_id: &str) -> MigrationId {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("mig-{workload_id}-{nanos:x}-{seq}")
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Run a due `Scheduled` migration to completion.
    ///
    /// Returns the `Completed` record, or `PhaseFailed` after a Preparing
    /// failure has been rolled back and sent through the retry edge.
    pub async fn execute_migration(&self, migration_id: &str) -> MigrateResult<MigrationRecord> {
        let migration = self.load_migration(migration_id)?;
        if migration.status != MigrationStatus::Scheduled {
            return Err(MigrateError::IllegalTransition {
                id: migration.id,
                from: migration.status,
                to: MigrationStatus::Preparing,
            });
        }

        let workload = match self.state().get_workload(&migration.workload_id)? {
            Some(w) => w,
            None => {
                self.abandon(&migration, "workload no longer exists")?;
                return Err(MigrateError::WorkloadNotFound(migration.workload_id));
            }
        };

        let now = epoch_secs();
        if let Err(ineligible) = can_execute(&workload, migration.reason, now, &self.config) {
            if ineligible.transient {
                let retry_at = now + self.config.retry_backoff.as_secs();
                self.state().update_migration(&migration.id, |m| m.scheduled_at = retry_at)?;
                debug!(
                    migration_id,
                    reason = %ineligible.reason,
                    retry_at,
                    "migration deferred"
                );
            } else {
                self.abandon(&migration, &ineligible.reason)?;
            }
            return Err(MigrateError::NotEligible {
                workload_id: workload.id,
                reason: ineligible.reason,
            });
        }
        if workload.node_id.as_deref() != Some(migration.source_node_id.as_str()) {
            let reason = format!(
                "workload moved off {} since the migration was recorded",
                migration.source_node_id
            );
            self.abandon(&migration, &reason)?;
            return Err(MigrateError::NotEligible {
                workload_id: workload.id,
                reason,
            });
        }

        let live = workload.status == WorkloadStatus::Running;
        let source_container = if live { workload.container_id.clone() } else { None };
        let occupants = workload.occupants;
        let migration = machine::advance(self.state(), migration_id, MigrationStatus::Scheduled, |m| {
            m.started_at = Some(now);
            m.occupants_at_start = occupants;
            m.source_container_id = source_container;
        })?;
        info!(
            migration_id,
            workload_id = %workload.id,
            source = %migration.source_node_id,
            live,
            "migration started"
        );
        self.emit_phase(&migration);

        let mut partial = PartialTarget::default();
        let prepared = self.prepare(&migration, &workload, live, &mut partial).await;
        let target = match prepared {
            Ok(target) => target,
            Err(source) => return Err(self.fail_preparing(&migration, partial, source).await),
        };

        let migration = machine::advance(self.state(), migration_id, MigrationStatus::Preparing, |_| {})?;
        self.emit_phase(&migration);
        self.finish(migration, target).await
    }

    /// Preparing: pick and charge the target, copy data, boot the new
    /// container and wait until it serves.
    async fn prepare(
        &self,
        migration: &MigrationRecord,
        workload: &WorkloadRecord,
        live: bool,
        partial: &mut PartialTarget,
    ) -> anyhow::Result<NodeInfo> {
        let source = self.require_node(&migration.source_node_id)?;
        let target = self.choose_target(migration, workload, live)?;
        partial.node = Some(target.clone());

        if live {
            if !self
                .lifecycle
                .ledger()
                .try_allocate(&target.id, workload.booked_ram_mb)
            {
                bail!(
                    "target {} has no room for {}MB",
                    target.id,
                    workload.booked_ram_mb
                );
            }
            partial.ram_mb = workload.booked_ram_mb;
        }
        let target_id = target.id.clone();
        let ram_mb = partial.ram_mb;
        self.state().update_migration(&migration.id, |m| {
            m.target_node_id = Some(target_id);
            m.target_ram_mb = ram_mb;
        })?;

        match plan_transfer(&source, workload).map_err(|e| anyhow!(e))? {
            TransferPlan::Snapshot { snapshot_id } => self
                .transfer
                .restore_snapshot(&snapshot_id, &target, &workload.data_path)
                .await
                .with_context(|| format!("restoring snapshot {snapshot_id} on {}", target.id))?,
            TransferPlan::Sync => self
                .transfer
                .sync_directory(&source, &target, &workload.data_path)
                .await
                .with_context(|| format!("syncing data from {} to {}", source.id, target.id))?,
        }
        debug!(migration_id = %migration.id, target = %target.id, "data transferred");

        if !live {
            return Ok(target);
        }

        let spec = ContainerSpec::for_workload(workload, &target);
        let handle = match self.lifecycle.runtimes().launch(&target, &spec).await {
            Ok(handle) => handle,
            Err(e) => {
                partial.handle = e.handle;
                return Err(e
                    .source
                    .context(format!("{} of target container on {} failed", e.phase, target.id)));
            }
        };
        partial.handle = Some(handle.clone());
        let container_id = handle.id.clone();
        self.state()
            .update_migration(&migration.id, |m| m.target_container_id = Some(container_id))?;

        let timeout = self.config.ready_timeout;
        let runtime = self.lifecycle.runtimes().for_node(&target);
        match tokio::time::timeout(timeout, runtime.wait_ready(&target, &handle, timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.context(format!("target container on {} not ready", target.id))),
            Err(_) => bail!(
                "target container on {} not ready after {}s",
                target.id,
                timeout.as_secs()
            ),
        }
        Ok(target)
    }

    /// The requested target if it is still usable, otherwise the best node
    /// other than the source.
    fn choose_target(
        &self,
        migration: &MigrationRecord,
        workload: &WorkloadRecord,
        live: bool,
    ) -> anyhow::Result<NodeInfo> {
        let selector = self.lifecycle.selector();
        let source_id = migration.source_node_id.as_str();
        let node_id = match &migration.target_node_id {
            Some(id) => {
                if id == source_id || !selector.is_hostable(id)? {
                    bail!("node {id} cannot receive workloads");
                }
                if live && self.share_host(source_id, id)? {
                    bail!("node {id} shares the control-plane host with {source_id}");
                }
                id.clone()
            }
            // Data-only moves charge no RAM, so any hostable node will do.
            None if !live => selector.select_node_excluding(0, &[source_id])?,
            None => {
                // Two containers of one workload cannot coexist on one
                // Docker host, so a live move leaves the host entirely.
                let mut excluded = vec![source_id.to_string()];
                if self.require_node(source_id)?.is_local() {
                    excluded.extend(
                        self.state()
                            .list_nodes()?
                            .into_iter()
                            .filter(NodeInfo::is_local)
                            .map(|n| n.id),
                    );
                }
                let excluded: Vec<&str> = excluded.iter().map(String::as_str).collect();
                selector.select_node_excluding(workload.booked_ram_mb, &excluded)?
            }
        };
        let node = self.require_node(&node_id)?;
        if !node.healthy {
            bail!("target {} is unhealthy", node.id);
        }
        Ok(node)
    }

    /// Whether both nodes run containers on the control-plane host.
    fn share_host(&self, a: &str, b: &str) -> MigrateResult<bool> {
        let (Some(a), Some(b)) = (self.state().get_node(a)?, self.state().get_node(b)?) else {
            return Ok(false);
        };
        Ok(a.is_local() && b.is_local())
    }

    /// Undo a Preparing attempt and take the retry edge.
    async fn fail_preparing(
        &self,
        migration: &MigrationRecord,
        partial: PartialTarget,
        source: anyhow::Error,
    ) -> MigrateError {
        self.rollback(&partial).await;

        let message = format!("{source:#}");
        let retry_at = epoch_secs() + self.config.retry_backoff.as_secs();
        match machine::fail_and_retry(
            self.state(),
            &migration.id,
            MigrationStatus::Preparing,
            &message,
            retry_at,
        ) {
            Ok(outcome) => {
                let will_retry = outcome.will_retry();
                let record = outcome.record();
                if will_retry {
                    warn!(
                        migration_id = %migration.id,
                        retry_count = record.retry_count,
                        max_retries = record.max_retries,
                        error = %message,
                        "migration failed, retry scheduled"
                    );
                } else {
                    error!(
                        migration_id = %migration.id,
                        retry_count = record.retry_count,
                        error = %message,
                        "migration failed, retries exhausted"
                    );
                }
                self.lifecycle.events().emit(LifecycleEvent::MigrationFailed {
                    migration_id: migration.id.clone(),
                    error: message,
                    will_retry,
                });
            }
            Err(e) => error!(migration_id = %migration.id, error = %e, "could not record migration failure"),
        }

        MigrateError::PhaseFailed {
            migration_id: migration.id.clone(),
            workload_id: migration.workload_id.clone(),
            phase: MigrationStatus::Preparing,
            source,
        }
    }

    async fn rollback(&self, partial: &PartialTarget) {
        let Some(node) = &partial.node else {
            return;
        };
        if let Some(handle) = &partial.handle {
            self.lifecycle.runtimes().discard(node, handle).await;
        }
        if partial.ram_mb > 0 {
            self.lifecycle.ledger().release(&node.id, partial.ram_mb);
        }
        debug!(target = %node.id, ram_mb = partial.ram_mb, "migration target rolled back");
    }

    /// Transferring and Completing. Failures from here on are warnings.
    async fn finish(
        &self,
        mut migration: MigrationRecord,
        target: NodeInfo,
    ) -> MigrateResult<MigrationRecord> {
        let mut warnings = Vec::new();
        let live = migration.target_container_id.is_some();
        let workload = self.load_workload(&migration.workload_id)?;

        if migration.status == MigrationStatus::Transferring {
            if live && workload.status == WorkloadStatus::Running {
                let address = workload_address(&workload, &target);
                if let Err(e) = self
                    .lifecycle
                    .routes()
                    .register_server(&workload.name, &address)
                    .await
                {
                    warnings.push(format!("route switch to {address} failed: {e:#}"));
                }
            }
            migration =
                machine::advance(self.state(), &migration.id, MigrationStatus::Transferring, |_| {})?;
            self.emit_phase(&migration);
        }

        if live {
            self.complete_live(&migration, &workload, &target, &mut warnings)
                .await?;
        } else {
            self.complete_data_only(&migration, &target, &mut warnings)?;
        }

        for message in &warnings {
            warn!(migration_id = %migration.id, warning = %message, "migration completed with warning");
            self.lifecycle.events().emit(LifecycleEvent::MigrationWarning {
                migration_id: migration.id.clone(),
                message: message.clone(),
            });
        }
        let migration = machine::advance(self.state(), &migration.id, MigrationStatus::Completing, |m| {
            m.completed_at = Some(epoch_secs());
            m.warnings.extend(warnings);
        })?;
        info!(
            migration_id = %migration.id,
            workload_id = %migration.workload_id,
            target = %target.id,
            warnings = migration.warnings.len(),
            "migration completed"
        );
        self.emit_phase(&migration);

        if !self.lifecycle.queue().is_empty() {
            self.lifecycle.trigger_queue_processing();
        }
        Ok(migration)
    }

    /// Tear down the source and hand the workload to the target container.
    async fn complete_live(
        &self,
        migration: &MigrationRecord,
        workload: &WorkloadRecord,
        target: &NodeInfo,
        warnings: &mut Vec<String>,
    ) -> MigrateResult<()> {
        let source_id = &migration.source_node_id;
        let source = self.state().get_node(source_id)?;
        match (&source, &migration.source_container_id) {
            (Some(source), Some(container_id)) => {
                let handle = ContainerHandle::new(container_id.clone());
                let runtime = self.lifecycle.runtimes().for_node(source);
                if workload.occupants > 0 {
                    let message = format!("Server is moving to a new host ({})", target.id);
                    if let Err(e) = runtime.notify_occupants(source, &handle, &message).await {
                        warnings.push(format!("occupant notice failed: {e:#}"));
                    }
                }
                if let Err(e) = runtime
                    .stop(source, &handle, self.lifecycle.config().stop_timeout)
                    .await
                {
                    warnings.push(format!("stopping source container {container_id} failed: {e:#}"));
                }
                if let Err(e) = runtime.remove(source, &handle, true).await {
                    warnings.push(format!("removing source container {container_id} failed: {e:#}"));
                }
            }
            (None, _) => warnings.push(format!("source node {source_id} no longer exists")),
            (Some(_), None) => {}
        }

        let Some(container_id) = migration.target_container_id.clone() else {
            return Ok(());
        };
        let granted = target.granted_ram_mb(workload.booked_ram_mb);
        let target_id = target.id.clone();
        let mut reassigned = false;
        let mut already_done = false;
        let current = self.state().update_workload(&workload.id, |w| {
            if w.node_id.as_deref() == Some(target_id.as_str())
                && w.container_id.as_deref() == Some(container_id.as_str())
            {
                already_done = true;
            } else if w.status == WorkloadStatus::Running
                && w.node_id.as_deref() == Some(source_id.as_str())
            {
                w.node_id = Some(target_id.clone());
                w.container_id = Some(container_id.clone());
                w.granted_ram_mb = granted;
                reassigned = true;
            }
        })?;

        if reassigned {
            self.lifecycle.ledger().release(source_id, workload.booked_ram_mb);
        } else if !already_done {
            warnings.push(format!(
                "workload left running state during migration (status: {}), target released",
                current.status
            ));
            self.lifecycle
                .runtimes()
                .discard(target, &ContainerHandle::new(container_id))
                .await;
            self.lifecycle
                .ledger()
                .release(&target.id, migration.target_ram_mb);
            self.restore_route(&current, warnings).await?;
        }
        Ok(())
    }

    /// Point the workload's route back at where it actually runs, or drop
    /// it when it is not running.
    async fn restore_route(
        &self,
        workload: &WorkloadRecord,
        warnings: &mut Vec<String>,
    ) -> MigrateResult<()> {
        let routes = self.lifecycle.routes();
        let node = match (&workload.status, &workload.node_id) {
            (WorkloadStatus::Running, Some(node_id)) => self.state().get_node(node_id)?,
            _ => None,
        };
        let outcome = match &node {
            Some(node) => {
                routes
                    .register_server(&workload.name, &workload_address(workload, node))
                    .await
            }
            None => routes.unregister_server(&workload.name).await,
        };
        if let Err(e) = outcome {
            warnings.push(format!("restoring route for {} failed: {e:#}", workload.name));
        }
        Ok(())
    }

    /// Move the home node of a stopped workload.
    fn complete_data_only(
        &self,
        migration: &MigrationRecord,
        target: &NodeInfo,
        warnings: &mut Vec<String>,
    ) -> MigrateResult<()> {
        let source_id = migration.source_node_id.as_str();
        let target_id = target.id.clone();
        let mut moved = false;
        let current = self.state().update_workload(&migration.workload_id, |w| {
            if w.node_id.as_deref() == Some(source_id)
                && matches!(w.status, WorkloadStatus::Stopped | WorkloadStatus::Sleeping)
            {
                w.node_id = Some(target_id);
                moved = true;
            }
        })?;
        if !moved && current.node_id.as_deref() != Some(target.id.as_str()) {
            warnings.push(format!(
                "workload changed during migration (status: {}), home node kept",
                current.status
            ));
        }
        Ok(())
    }

    /// Cancel a `Scheduled` migration that can never run.
    fn abandon(&self, migration: &MigrationRecord, reason: &str) -> MigrateResult<()> {
        let outcome = self.state().transition_migration(
            &migration.id,
            &[MigrationStatus::Scheduled],
            MigrationStatus::Cancelled,
            |m| {
                m.last_error = Some(reason.to_string());
                m.completed_at = Some(epoch_secs());
            },
        )?;
        if let Transition::Applied(m) = outcome {
            warn!(migration_id = %m.id, reason, "migration abandoned");
            self.emit_phase(&m);
        }
        Ok(())
    }

    // ── Polling ────────────────────────────────────────────────────

    /// Dispatch every due migration onto its own task.
    pub fn poll_due(self: &Arc<Self>) -> MigrateResult<Vec<JoinHandle<()>>> {
        let due = self.state().find_pending_migrations(epoch_secs())?;
        if !due.is_empty() {
            debug!(count = due.len(), "dispatching due migrations");
        }
        Ok(due
            .into_iter()
            .map(|m| {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    match this.execute_migration(&m.id).await {
                        Ok(_) => {}
                        Err(MigrateError::NotEligible { reason, .. }) => {
                            debug!(migration_id = %m.id, %reason, "migration not executed");
                        }
                        Err(MigrateError::IllegalTransition { from, .. }) => {
                            debug!(migration_id = %m.id, status = %from, "migration already taken");
                        }
                        Err(e) => warn!(migration_id = %m.id, error = %e, "migration attempt failed"),
                    }
                })
            })
            .collect())
    }

    /// Poll for due migrations now and every `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "migration poller started");

        loop {
            if let Err(e) = self.poll_due() {
                warn!(error = %e, "migration poll failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("migration poller shutting down");
                    break;
                }
            }
        }
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Reconcile migrations left mid-phase by a previous process.
    ///
    /// Must run after the ledger is rebuilt: the rebuilt ledger charges
    /// workloads on their recorded node and never a migration target.
    pub async fn recover(&self) -> MigrateResult<MigrationRecoveryReport> {
        let mut report = MigrationRecoveryReport::default();

        for m in self
            .state()
            .list_migrations_by_status(&[MigrationStatus::Preparing])?
        {
            let mut partial = PartialTarget::default();
            if let Some(target_id) = &m.target_node_id {
                partial.node = self.state().get_node(target_id)?;
                partial.handle = m.target_container_id.clone().map(ContainerHandle::new);
            }
            self.rollback(&partial).await;
            let retry_at = epoch_secs() + self.config.retry_backoff.as_secs();
            let outcome = machine::fail_and_retry(
                self.state(),
                &m.id,
                MigrationStatus::Preparing,
                "preparation interrupted by control-plane restart",
                retry_at,
            )?;
            warn!(migration_id = %m.id, will_retry = outcome.will_retry(), "failed interrupted migration");
            report.failed += 1;
        }

        for m in self
            .state()
            .list_migrations_by_status(&[MigrationStatus::Transferring, MigrationStatus::Completing])?
        {
            match self.resume(m.clone()).await {
                Ok(_) => report.resumed += 1,
                Err(e) => error!(migration_id = %m.id, error = %e, "could not resume migration"),
            }
        }

        info!(failed = report.failed, resumed = report.resumed, "migration recovery complete");
        Ok(report)
    }

    async fn resume(&self, migration: MigrationRecord) -> MigrateResult<MigrationRecord> {
        let target_id = migration
            .target_node_id
            .clone()
            .ok_or_else(|| MigrateError::InvalidTarget(format!("migration {} has no target", migration.id)))?;
        let target = self
            .state()
            .get_node(&target_id)?
            .ok_or_else(|| MigrateError::NodeNotFound(target_id.clone()))?;

        let workload = self.load_workload(&migration.workload_id)?;
        let handed_over = workload.node_id.as_deref() == Some(target_id.as_str());
        if migration.target_ram_mb > 0
            && !handed_over
            && !self
                .lifecycle
                .ledger()
                .try_allocate(&target_id, migration.target_ram_mb)
        {
            warn!(
                migration_id = %migration.id,
                target = %target_id,
                ram_mb = migration.target_ram_mb,
                "could not re-charge migration target"
            );
        }
        info!(migration_id = %migration.id, status = %migration.status, "resuming migration");
        self.finish(migration, target).await
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn emit_phase(&self, m: &MigrationRecord) {
        self.lifecycle.events().emit(LifecycleEvent::MigrationPhase {
            migration_id: m.id.clone(),
            workload_id: m.workload_id.clone(),
            status: m.status,
        });
    }

    fn load_workload(&self, workload_id: &str) -> MigrateResult<WorkloadRecord> {
        self.state()
            .get_workload(workload_id)?
            .ok_or_else(|| MigrateError::WorkloadNotFound(workload_id.to_string()))
    }

    fn load_migration(&self, migration_id: &str) -> MigrateResult<MigrationRecord> {
        self.state()
            .get_migration(migration_id)
            .map_err(|e| match e {
                StateError::NotFound(_) => MigrateError::MigrationNotFound(migration_id.to_string()),
                other => other.into(),
            })?
            .ok_or_else(|| MigrateError::MigrationNotFound(migration_id.to_string()))
    }

    fn require_node(&self, node_id: &str) -> anyhow::Result<NodeInfo> {
        self.state()
            .get_node(node_id)?
            .ok_or_else(|| anyhow!("node {node_id} not found"))
    }
}
