//! Workload lifecycle controller: start, stop, and queue processing.
//!
//! A start claims the workload by moving it to `Starting` with a
//! compare-and-set, so concurrent starts of one workload cannot both pass.
//! The claim is followed by admission (load check, boot slot, node
//! selection, RAM allocation) and the container launch. Reservations are
//! held by an [`AdmissionGuard`] that undoes them on every early return;
//! only a workload that reaches `Running` keeps its RAM.
//!
//! Admission contention parks the workload in `Queued`. Runtime failures
//! park it in `Error` with the reason recorded.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hearthgrid_placement::{NodeSelector, PlacementError, ResourceLedger};
use hearthgrid_state::{
    MigrationStatus, NodeId, NodeInfo, StateError, StateStore, Transition, WorkloadRecord,
    WorkloadStatus, epoch_secs,
};

use crate::archive::Unarchiver;
use crate::boot::BootAdmissionController;
use crate::error::{Phase, QueueReason, SchedulerError, SchedulerResult};
use crate::events::{EventSink, LifecycleEvent, TracingEventSink};
use crate::queue::{QueueEntry, StartQueue};
use crate::routing::{RouteRegistrar, StoreRoutes, workload_address};
use crate::runtime::{ContainerHandle, ContainerSpec, Runtimes};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Timeouts for container operations.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long to wait for a booted server to accept connections.
    pub ready_timeout: Duration,
    /// Delay between warning occupants and stopping the container.
    pub shutdown_notice: Duration,
    /// Grace period given to the container on stop.
    pub stop_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(120),
            shutdown_notice: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Why a workload is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Requested by the owner or an operator.
    Manual,
    /// No occupants for too long; the workload goes to sleep.
    Idle,
    /// The control plane or its node is shutting down.
    Shutdown,
}

impl StopReason {
    /// Status the workload ends in after a clean stop.
    pub fn final_status(self) -> WorkloadStatus {
        match self {
            StopReason::Idle => WorkloadStatus::Sleeping,
            StopReason::Manual | StopReason::Shutdown => WorkloadStatus::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Manual => "manual",
            StopReason::Idle => "idle",
            StopReason::Shutdown => "shutdown",
        }
    }
}

/// Outcome of [`WorkloadLifecycleController::process_queue`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub passes: usize,
    pub started: usize,
    /// Entries dropped after a runtime failure.
    pub failed: usize,
    /// Entries left in the queue afterwards.
    pub remaining: usize,
}

/// Counts from [`WorkloadLifecycleController::recover`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub interrupted_starts: usize,
    pub interrupted_stops: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    /// A fresh request: runs the host-load check.
    Direct,
    /// Dequeued by the queue processor, which already checked load.
    FromQueue,
}

impl StartMode {
    fn sources(self) -> &'static [WorkloadStatus] {
        use WorkloadStatus::*;
        match self {
            StartMode::Direct => &[Stopped, Sleeping, Archived, Error, Queued],
            StartMode::FromQueue => &[Queued],
        }
    }
}

/// Why a claimed start did not reach `Running`.
enum StartFailure {
    Queue(QueueReason, String),
    Fatal(SchedulerError),
}

impl From<SchedulerError> for StartFailure {
    fn from(e: SchedulerError) -> Self {
        StartFailure::Fatal(e)
    }
}

impl From<StateError> for StartFailure {
    fn from(e: StateError) -> Self {
        StartFailure::Fatal(e.into())
    }
}

impl From<PlacementError> for StartFailure {
    fn from(e: PlacementError) -> Self {
        StartFailure::Fatal(e.into())
    }
}

/// Boot slot and RAM reserved by one start attempt.
///
/// Dropping the guard releases both. [`commit`](Self::commit) keeps the
/// RAM (the workload is now running) and releases only the slot.
struct AdmissionGuard<'a> {
    boot: &'a BootAdmissionController,
    ledger: &'a ResourceLedger,
    workload_id: &'a str,
    slot_held: bool,
    allocation: Option<(NodeId, u64)>,
}

impl<'a> AdmissionGuard<'a> {
    fn new(
        boot: &'a BootAdmissionController,
        ledger: &'a ResourceLedger,
        workload_id: &'a str,
    ) -> Self {
        Self {
            boot,
            ledger,
            workload_id,
            slot_held: false,
            allocation: None,
        }
    }

    fn reserve_boot_slot(&mut self) -> bool {
        self.slot_held = self.boot.reserve_boot_slot(self.workload_id);
        self.slot_held
    }

    fn allocate(&mut self, node_id: &str, mb: u64) -> bool {
        if !self.ledger.try_allocate(node_id, mb) {
            return false;
        }
        self.allocation = Some((node_id.to_string(), mb));
        true
    }

    fn commit(mut self) {
        self.allocation = None;
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if let Some((node_id, mb)) = self.allocation.take() {
            self.ledger.release(&node_id, mb);
            debug!(
                workload_id = %self.workload_id,
                node = %node_id,
                mb,
                "rolled back RAM allocation"
            );
        }
        if self.slot_held {
            self.boot.release_boot_slot(self.workload_id);
        }
    }
}

/// Orchestrates workload start/stop over the admission primitives.
pub struct WorkloadLifecycleController {
    state: StateStore,
    ledger: Arc<ResourceLedger>,
    selector: NodeSelector,
    boot: Arc<BootAdmissionController>,
    queue: Arc<StartQueue>,
    runtimes: Runtimes,
    routes: Arc<dyn RouteRegistrar>,
    events: Arc<dyn EventSink>,
    unarchiver: Option<Arc<dyn Unarchiver>>,
    config: LifecycleConfig,
}

impl WorkloadLifecycleController {
    pub fn new(
        state: StateStore,
        ledger: Arc<ResourceLedger>,
        boot: Arc<BootAdmissionController>,
        queue: Arc<StartQueue>,
        runtimes: Runtimes,
    ) -> Self {
        Self {
            selector: NodeSelector::new(state.clone(), Arc::clone(&ledger)),
            routes: Arc::new(StoreRoutes::new(state.clone())),
            events: Arc::new(TracingEventSink),
            unarchiver: None,
            config: LifecycleConfig::default(),
            state,
            ledger,
            boot,
            queue,
            runtimes,
        }
    }

    pub fn with_selector(mut self, selector: NodeSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_routes(mut self, routes: Arc<dyn RouteRegistrar>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_unarchiver(mut self, unarchiver: Arc<dyn Unarchiver>) -> Self {
        self.unarchiver = Some(unarchiver);
        self
    }

    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn selector(&self) -> &NodeSelector {
        &self.selector
    }

    pub fn boot(&self) -> &Arc<BootAdmissionController> {
        &self.boot
    }

    pub fn queue(&self) -> &Arc<StartQueue> {
        &self.queue
    }

    pub fn runtimes(&self) -> &Runtimes {
        &self.runtimes
    }

    pub fn routes(&self) -> &Arc<dyn RouteRegistrar> {
        &self.routes
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ── Start ──────────────────────────────────────────────────────

    /// Start a stopped, sleeping, archived, errored or queued workload.
    ///
    /// Returns the running record, or `SchedulerError::Queued` when the
    /// workload had to wait for capacity.
    pub async fn start_workload(
        self: &Arc<Self>,
        workload_id: &str,
    ) -> SchedulerResult<WorkloadRecord> {
        self.start(workload_id, StartMode::Direct).await
    }

    /// Start a queued workload, skipping the host-load pre-check.
    ///
    /// Boot slot and RAM are still claimed atomically; if either is gone
    /// the entry stays where it is in the queue.
    pub async fn start_workload_from_queue(
        self: &Arc<Self>,
        workload_id: &str,
    ) -> SchedulerResult<WorkloadRecord> {
        self.start(workload_id, StartMode::FromQueue).await
    }

    async fn start(
        self: &Arc<Self>,
        workload_id: &str,
        mode: StartMode,
    ) -> SchedulerResult<WorkloadRecord> {
        let current = self.load_workload(workload_id)?;
        self.check_startable(&current, mode)?;
        self.ensure_not_migrating(workload_id)?;

        let claimed = match self
            .state
            .transition_workload(workload_id, mode.sources(), WorkloadStatus::Starting, |w| {
                w.last_error = None;
            })? {
            Transition::Applied(w) => w,
            Transition::Rejected(w) => {
                self.check_startable(&w, mode)?;
                return Err(SchedulerError::NotStartable {
                    workload_id: workload_id.to_string(),
                    status: w.status,
                });
            }
        };
        info!(workload_id, from = %current.status, "workload starting");

        let outcome = self.admit_and_launch(claimed, current.status, mode).await;
        let result = match outcome {
            Ok(running) => Ok(running),
            Err(StartFailure::Queue(reason, detail)) => {
                Err(self.park(workload_id, reason, detail))
            }
            Err(StartFailure::Fatal(e)) => Err(self.fail_start(workload_id, e)),
        };

        // A dequeued start runs inside a drain, which moves on by itself.
        if mode == StartMode::Direct && self.boot.is_available() && !self.queue.is_empty() {
            self.trigger_queue_processing();
        }
        result
    }

    /// Reject duplicate starts and starts from illegal states before
    /// touching anything.
    fn check_startable(&self, workload: &WorkloadRecord, mode: StartMode) -> SchedulerResult<()> {
        let status = workload.status;
        let already_active = || SchedulerError::AlreadyActive {
            workload_id: workload.id.clone(),
            status,
        };

        match (mode, status) {
            (_, WorkloadStatus::Starting) => Err(already_active()),
            (_, WorkloadStatus::Running) => {
                if mode == StartMode::FromQueue {
                    self.queue.remove(&workload.id);
                }
                Err(already_active())
            }
            (StartMode::FromQueue, WorkloadStatus::Queued) => Ok(()),
            (StartMode::FromQueue, _) => {
                self.queue.remove(&workload.id);
                Err(SchedulerError::NotQueued(workload.id.clone()))
            }
            (StartMode::Direct, s) if mode.sources().contains(&s) => Ok(()),
            (StartMode::Direct, _) => Err(SchedulerError::NotStartable {
                workload_id: workload.id.clone(),
                status,
            }),
        }
    }

    async fn admit_and_launch(
        &self,
        mut workload: WorkloadRecord,
        previous: WorkloadStatus,
        mode: StartMode,
    ) -> Result<WorkloadRecord, StartFailure> {
        let workload_id = workload.id.clone();

        if previous == WorkloadStatus::Error {
            workload = self.reclaim_leftovers(workload).await?;
        }
        if previous == WorkloadStatus::Archived {
            self.unarchive(&workload).await?;
            workload = self.load_workload(&workload_id)?;
        }

        let booked = workload.booked_ram_mb;
        let mut admission = AdmissionGuard::new(&self.boot, &self.ledger, &workload_id);

        if mode == StartMode::Direct {
            let verdict = self.boot.can_boot(booked);
            if !verdict.allowed {
                return Err(StartFailure::Queue(QueueReason::Capacity, verdict.reason));
            }
        }

        if !admission.reserve_boot_slot() {
            let holder = self.boot.holder().unwrap_or_default();
            return Err(StartFailure::Queue(
                QueueReason::Contention,
                format!("boot slot held by {holder}"),
            ));
        }

        let node_id = match self
            .selector
            .select_node_preferring(booked, workload.node_id.as_deref())
        {
            Ok(node_id) => node_id,
            Err(PlacementError::NoEligibleNode {
                required_mb,
                considered,
            }) => {
                return Err(StartFailure::Queue(
                    QueueReason::Placement,
                    format!("no node with {required_mb} MB free ({considered} considered)"),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        if !admission.allocate(&node_id, booked) {
            return Err(StartFailure::Queue(
                QueueReason::Capacity,
                format!("node {node_id} no longer has {booked} MB free"),
            ));
        }

        let node = self.load_node(&node_id)?;
        let granted = node.granted_ram_mb(booked);
        workload = self.state.update_workload(&workload_id, |w| {
            w.node_id = Some(node_id.clone());
            w.granted_ram_mb = granted;
        })?;
        self.events.emit(LifecycleEvent::Starting {
            workload_id: workload_id.clone(),
            node_id: node_id.clone(),
        });

        let spec = ContainerSpec::for_workload(&workload, &node);
        let handle = match self.runtimes.launch(&node, &spec).await {
            Ok(handle) => handle,
            Err(launch) => {
                if let Some(handle) = &launch.handle {
                    self.runtimes.discard(&node, handle).await;
                }
                return Err(StartFailure::Fatal(SchedulerError::Runtime {
                    workload_id: workload_id.clone(),
                    node_id,
                    phase: launch.phase,
                    source: launch.source,
                }));
            }
        };

        if let Err(e) = self.state.update_workload(&workload_id, |w| {
            w.container_id = Some(handle.id.clone());
        }) {
            self.runtimes.discard(&node, &handle).await;
            return Err(e.into());
        }

        let ready = self.await_ready(&node, &handle, &workload_id).await;

        let started_at = epoch_secs();
        let running = match self.state.transition_workload(
            &workload_id,
            &[WorkloadStatus::Starting],
            WorkloadStatus::Running,
            |w| {
                w.node_id = Some(node_id.clone());
                w.container_id = Some(handle.id.clone());
                w.last_started_at = Some(started_at);
            },
        ) {
            Ok(Transition::Applied(w)) => w,
            Ok(Transition::Rejected(w)) => {
                self.runtimes.discard(&node, &handle).await;
                return Err(StartFailure::Fatal(SchedulerError::Runtime {
                    workload_id: workload_id.clone(),
                    node_id,
                    phase: Phase::Start,
                    source: anyhow!("workload left starting state during boot (now {})", w.status),
                }));
            }
            Err(e) => {
                self.runtimes.discard(&node, &handle).await;
                return Err(e.into());
            }
        };
        admission.commit();

        self.queue.remove(&workload_id);
        if let Err(e) = self
            .routes
            .register_server(&running.name, &workload_address(&running, &node))
            .await
        {
            warn!(workload_id = %workload_id, error = %e, "failed to register route");
        }

        info!(
            workload_id = %workload_id,
            node = %node_id,
            container = %handle.id,
            ram_mb = booked,
            ready,
            "workload running"
        );
        self.events.emit(LifecycleEvent::Started {
            workload_id,
            node_id,
            ready,
        });
        Ok(running)
    }

    /// Force-remove the container and release the RAM a failed run left
    /// behind.
    async fn reclaim_leftovers(
        &self,
        workload: WorkloadRecord,
    ) -> Result<WorkloadRecord, StartFailure> {
        let (Some(node_id), Some(container_id)) = (&workload.node_id, &workload.container_id)
        else {
            return Ok(workload);
        };

        if let Some(node) = self.state.get_node(node_id)? {
            self.runtimes
                .discard(&node, &ContainerHandle::new(container_id.clone()))
                .await;
        }
        self.ledger.release(node_id, workload.booked_ram_mb);
        info!(
            workload_id = %workload.id,
            node = %node_id,
            container = %container_id,
            "reclaimed resources of failed run"
        );

        Ok(self.state.update_workload(&workload.id, |w| {
            w.container_id = None;
            w.granted_ram_mb = 0;
        })?)
    }

    async fn unarchive(&self, workload: &WorkloadRecord) -> Result<(), StartFailure> {
        let node_id = workload.node_id.clone().unwrap_or_default();
        let Some(unarchiver) = &self.unarchiver else {
            return Err(StartFailure::Fatal(SchedulerError::Runtime {
                workload_id: workload.id.clone(),
                node_id,
                phase: Phase::Unarchive,
                source: anyhow!("no unarchiver configured"),
            }));
        };
        unarchiver.unarchive(workload).await.map_err(|source| {
            StartFailure::Fatal(SchedulerError::Runtime {
                workload_id: workload.id.clone(),
                node_id,
                phase: Phase::Unarchive,
                source,
            })
        })
    }

    /// Wait for readiness. A server that is slow to come up is still
    /// marked running.
    async fn await_ready(&self, node: &NodeInfo, handle: &ContainerHandle, workload_id: &str) -> bool {
        let timeout = self.config.ready_timeout;
        let runtime = self.runtimes.for_node(node);
        match tokio::time::timeout(timeout, runtime.wait_ready(node, handle, timeout)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(workload_id, error = %e, "readiness check failed, continuing");
                false
            }
            Err(_) => {
                warn!(
                    workload_id,
                    timeout_secs = timeout.as_secs(),
                    "workload not ready before timeout, continuing"
                );
                false
            }
        }
    }

    /// Move a claimed workload back to `Queued` and enqueue it.
    fn park(&self, workload_id: &str, reason: QueueReason, detail: String) -> SchedulerError {
        match self.state.transition_workload(
            workload_id,
            &[WorkloadStatus::Starting],
            WorkloadStatus::Queued,
            |_| {},
        ) {
            Ok(Transition::Applied(w)) => {
                self.queue
                    .enqueue(&w.id, &w.owner_id, w.booked_ram_mb, reason);
                info!(workload_id, %reason, detail = %detail, "workload queued");
                self.events.emit(LifecycleEvent::Queued {
                    workload_id: workload_id.to_string(),
                    reason,
                });
            }
            Ok(Transition::Rejected(w)) => {
                warn!(workload_id, status = %w.status, "workload left starting state before it could be queued");
            }
            Err(e) => return e.into(),
        }
        SchedulerError::Queued {
            workload_id: workload_id.to_string(),
            reason,
            detail,
        }
    }

    /// Record a fatal start failure on the workload.
    fn fail_start(&self, workload_id: &str, err: SchedulerError) -> SchedulerError {
        self.queue.remove(workload_id);
        let message = err.to_string();
        error!(workload_id, error = %message, "workload start failed");

        match self.state.transition_workload(
            workload_id,
            &[WorkloadStatus::Starting],
            WorkloadStatus::Error,
            |w| {
                w.container_id = None;
                w.granted_ram_mb = 0;
                w.last_error = Some(message.clone());
            },
        ) {
            Ok(Transition::Applied(_)) => {}
            Ok(Transition::Rejected(w)) => {
                warn!(workload_id, status = %w.status, "could not record start failure");
            }
            Err(e) => {
                error!(workload_id, error = %e, "could not record start failure");
            }
        }
        self.events.emit(LifecycleEvent::StartFailed {
            workload_id: workload_id.to_string(),
            error: message,
        });
        err
    }

    /// Refuse to touch a workload whose migration is past `Scheduled`.
    fn ensure_not_migrating(&self, workload_id: &str) -> SchedulerResult<()> {
        match self.state.active_migration_for(workload_id)? {
            Some(migration)
                if matches!(
                    migration.status,
                    MigrationStatus::Preparing
                        | MigrationStatus::Transferring
                        | MigrationStatus::Completing
                ) =>
            {
                Err(SchedulerError::MigrationInProgress {
                    workload_id: workload_id.to_string(),
                    migration_id: migration.id,
                })
            }
            _ => Ok(()),
        }
    }

    // ── Stop ───────────────────────────────────────────────────────

    /// Stop a running workload.
    ///
    /// Occupants get a shutdown notice first. A container that refuses
    /// to stop leaves the workload in `Error` with its RAM still charged.
    pub async fn stop_workload(
        self: &Arc<Self>,
        workload_id: &str,
        reason: StopReason,
    ) -> SchedulerResult<WorkloadRecord> {
        self.ensure_not_migrating(workload_id)?;
        let workload = match self
            .state
            .transition_workload(
                workload_id,
                &[WorkloadStatus::Running],
                WorkloadStatus::Stopping,
                |_| {},
            )
            .map_err(|e| missing_workload(workload_id, e))?
        {
            Transition::Applied(w) => w,
            Transition::Rejected(w) => {
                return Err(SchedulerError::NotRunning {
                    workload_id: workload_id.to_string(),
                    status: w.status,
                });
            }
        };
        info!(workload_id, reason = reason.as_str(), "workload stopping");
        self.events.emit(LifecycleEvent::Stopping {
            workload_id: workload_id.to_string(),
        });

        let node = match &workload.node_id {
            Some(node_id) => self.state.get_node(node_id)?,
            None => None,
        };
        match (&node, &workload.container_id) {
            (Some(node), Some(container_id)) => {
                let handle = ContainerHandle::new(container_id.clone());
                self.terminate(&workload, node, &handle).await?;
            }
            _ => warn!(workload_id, "no live container recorded, finishing stop"),
        }

        let stopped_at = epoch_secs();
        let stopped = match self.state.transition_workload(
            workload_id,
            &[WorkloadStatus::Stopping],
            reason.final_status(),
            |w| {
                w.container_id = None;
                w.granted_ram_mb = 0;
                w.occupants = 0;
                w.last_stopped_at = Some(stopped_at);
            },
        )? {
            Transition::Applied(w) => w,
            Transition::Rejected(w) => {
                warn!(workload_id, status = %w.status, "workload changed state while stopping");
                w
            }
        };

        if let Some(node_id) = &workload.node_id {
            self.ledger.release(node_id, workload.booked_ram_mb);
        }
        if let Err(e) = self.routes.unregister_server(&workload.name).await {
            warn!(workload_id, error = %e, "failed to unregister route");
        }

        info!(workload_id, status = %stopped.status, "workload stopped");
        self.events.emit(LifecycleEvent::Stopped {
            workload_id: workload_id.to_string(),
            status: stopped.status,
        });
        if !self.queue.is_empty() {
            self.trigger_queue_processing();
        }
        Ok(stopped)
    }

    /// Notify occupants, stop and remove the container.
    async fn terminate(
        &self,
        workload: &WorkloadRecord,
        node: &NodeInfo,
        handle: &ContainerHandle,
    ) -> SchedulerResult<()> {
        let runtime = self.runtimes.for_node(node);
        let notice = self.config.shutdown_notice;

        if workload.occupants > 0 && !notice.is_zero() {
            let message = format!("Server is shutting down in {} seconds", notice.as_secs());
            if let Err(e) = runtime.notify_occupants(node, handle, &message).await {
                warn!(workload_id = %workload.id, error = %e, "failed to notify occupants");
            }
            tokio::time::sleep(notice).await;
        }

        if let Err(source) = runtime.stop(node, handle, self.config.stop_timeout).await {
            let err = SchedulerError::Runtime {
                workload_id: workload.id.clone(),
                node_id: node.id.clone(),
                phase: Phase::Stop,
                source,
            };
            self.fail_stop(&workload.id, &err);
            return Err(err);
        }

        if let Err(e) = runtime.remove(node, handle, false).await {
            warn!(
                workload_id = %workload.id,
                container = %handle.id,
                error = %e,
                "container stopped but not removed"
            );
        }
        Ok(())
    }

    fn fail_stop(&self, workload_id: &str, err: &SchedulerError) {
        let message = err.to_string();
        error!(workload_id, error = %message, "workload stop failed");
        match self.state.transition_workload(
            workload_id,
            &[WorkloadStatus::Stopping],
            WorkloadStatus::Error,
            |w| w.last_error = Some(message.clone()),
        ) {
            Ok(Transition::Applied(_)) => {}
            Ok(Transition::Rejected(w)) => {
                warn!(workload_id, status = %w.status, "could not record stop failure");
            }
            Err(e) => error!(workload_id, error = %e, "could not record stop failure"),
        }
        self.events.emit(LifecycleEvent::StopFailed {
            workload_id: workload_id.to_string(),
            error: message,
        });
    }

    // ── Queue ──────────────────────────────────────────────────────

    /// Withdraw a queued start request; the workload returns to `Stopped`.
    pub fn cancel_queued(&self, workload_id: &str) -> SchedulerResult<WorkloadRecord> {
        let removed = self.queue.remove(workload_id).is_some();
        match self
            .state
            .transition_workload(
                workload_id,
                &[WorkloadStatus::Queued],
                WorkloadStatus::Stopped,
                |_| {},
            )
            .map_err(|e| missing_workload(workload_id, e))?
        {
            Transition::Applied(w) => {
                info!(workload_id, "queued start cancelled");
                Ok(w)
            }
            Transition::Rejected(w) => {
                if removed {
                    warn!(workload_id, status = %w.status, "dropped stale queue entry");
                }
                Err(SchedulerError::NotQueued(workload_id.to_string()))
            }
        }
    }

    /// Try to start queued workloads in enqueue order.
    ///
    /// Safe to call from any number of triggers at once: one caller
    /// drains, the others only request another pass.
    pub async fn process_queue(self: &Arc<Self>) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let Some(guard) = self.queue.begin_drain() else {
                debug!("queue drain already in progress");
                break;
            };
            report.passes += 1;
            self.drain_pass(&mut report).await;
            drop(guard);
            if !self.queue.take_rerun() {
                break;
            }
        }
        report.remaining = self.queue.len();
        report
    }

    async fn drain_pass(self: &Arc<Self>, report: &mut DrainReport) {
        for entry in self.queue.entries() {
            if !self.queue.is_queued(&entry.workload_id) {
                continue;
            }
            if !self.boot.is_available() {
                debug!("boot slot busy, pausing queue drain");
                break;
            }
            if !self.admissible(&entry) {
                continue;
            }

            match self.start_workload_from_queue(&entry.workload_id).await {
                Ok(_) => report.started += 1,
                Err(e) if e.is_queued() => {}
                Err(e @ SchedulerError::Runtime { .. }) => {
                    warn!(workload_id = %entry.workload_id, error = %e, "queued start failed");
                    report.failed += 1;
                }
                Err(e) => {
                    debug!(workload_id = %entry.workload_id, error = %e, "skipping queue entry");
                }
            }
        }
    }

    /// Whether a queued entry could start right now.
    fn admissible(&self, entry: &QueueEntry) -> bool {
        let verdict = self.boot.can_boot(entry.required_ram_mb);
        if !verdict.allowed {
            debug!(workload_id = %entry.workload_id, reason = %verdict.reason, "queued start deferred");
            return false;
        }
        match self.selector.fits_anywhere(entry.required_ram_mb) {
            Ok(fits) => fits,
            Err(e) => {
                warn!(workload_id = %entry.workload_id, error = %e, "placement check failed");
                false
            }
        }
    }

    /// Drain the queue in the background.
    pub fn trigger_queue_processing(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let task: BoxFuture<()> = Box::pin(async move {
            let report = this.process_queue().await;
            if report.started > 0 || report.failed > 0 {
                info!(
                    started = report.started,
                    failed = report.failed,
                    remaining = report.remaining,
                    "start queue processed"
                );
            }
        });
        tokio::spawn(task);
    }

    /// Drain the queue every `interval` until `shutdown` fires.
    pub async fn run_queue_poller(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "queue poller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if self.queue.is_empty() {
                        continue;
                    }
                    let report = self.process_queue().await;
                    debug!(
                        started = report.started,
                        remaining = report.remaining,
                        "queue poll complete"
                    );
                }
                _ = shutdown.changed() => {
                    info!("queue poller shutting down");
                    break;
                }
            }
        }
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Reconcile workloads left mid-operation by a previous process.
    ///
    /// Must run after the ledger is rebuilt and before any new request.
    /// Queued workloads are re-enqueued oldest first. Interrupted boots
    /// are failed and their RAM released. Interrupted stops are marked
    /// `Error` with the container kept, so a later start reclaims it.
    pub async fn recover(&self) -> SchedulerResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let mut queued = self.state.list_workloads_by_status(&[WorkloadStatus::Queued])?;
        queued.sort_by_key(|w| (w.updated_at, w.created_at));
        for w in queued {
            if self.queue.restore(QueueEntry {
                workload_id: w.id.clone(),
                owner_id: w.owner_id.clone(),
                required_ram_mb: w.booked_ram_mb,
                enqueued_at: w.updated_at,
                reason: QueueReason::Capacity,
            }) {
                report.requeued += 1;
            }
        }

        for w in self.state.list_workloads_by_status(&[WorkloadStatus::Starting])? {
            if let (Some(node_id), Some(container_id)) = (&w.node_id, &w.container_id) {
                if let Some(node) = self.state.get_node(node_id)? {
                    self.runtimes
                        .discard(&node, &ContainerHandle::new(container_id.clone()))
                        .await;
                }
            }
            let applied = self
                .state
                .transition_workload(&w.id, &[WorkloadStatus::Starting], WorkloadStatus::Error, |r| {
                    r.container_id = None;
                    r.granted_ram_mb = 0;
                    r.last_error = Some("boot interrupted by control-plane restart".to_string());
                })?
                .is_applied();
            if applied {
                if let Some(node_id) = &w.node_id {
                    self.ledger.release(node_id, w.booked_ram_mb);
                }
                warn!(workload_id = %w.id, "failed interrupted boot");
                report.interrupted_starts += 1;
            }
        }

        for w in self.state.list_workloads_by_status(&[WorkloadStatus::Stopping])? {
            let applied = self
                .state
                .transition_workload(&w.id, &[WorkloadStatus::Stopping], WorkloadStatus::Error, |r| {
                    r.last_error = Some("stop interrupted by control-plane restart".to_string());
                })?
                .is_applied();
            if applied {
                warn!(workload_id = %w.id, "failed interrupted stop");
                report.interrupted_stops += 1;
            }
        }

        info!(
            requeued = report.requeued,
            interrupted_starts = report.interrupted_starts,
            interrupted_stops = report.interrupted_stops,
            "lifecycle recovery complete"
        );
        Ok(report)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn load_workload(&self, workload_id: &str) -> SchedulerResult<WorkloadRecord> {
        self.state
            .get_workload(workload_id)?
            .ok_or_else(|| SchedulerError::WorkloadNotFound(workload_id.to_string()))
    }

    fn load_node(&self, node_id: &str) -> SchedulerResult<NodeInfo> {
        self.state
            .get_node(node_id)?
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))
    }
}

fn missing_workload(workload_id: &str, e: StateError) -> SchedulerError {
    match e {
        StateError::NotFound(_) => SchedulerError::WorkloadNotFound(workload_id.to_string()),
        other => other.into(),
    }
}
