//! In-memory fakes for exercising the scheduler without containers.
//!
//! Enabled under `cfg(test)` and by the `testing` feature for downstream
//! crates.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::watch;

use hearthgrid_placement::ResourceLedger;
use hearthgrid_state::{
    MigrationPrefs, NodeInfo, NodeRole, NodeTransport, StateStore, WorkloadRecord,
    WorkloadStatus, epoch_secs,
};

use crate::archive::Unarchiver;
use crate::boot::{BootAdmissionController, BootConfig, LoadProbe};
use crate::events::{EventSink, LifecycleEvent};
use crate::lifecycle::{LifecycleConfig, WorkloadLifecycleController};
use crate::queue::StartQueue;
use crate::routing::RouteRegistrar;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, Runtimes};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Fixtures ──────────────────────────────────────────────────────

/// A healthy worker node reached over SSH.
pub fn worker_node(id: &str, capacity_mb: u64) -> NodeInfo {
    NodeInfo {
        id: id.to_string(),
        address: format!("{id}.fleet.internal"),
        transport: NodeTransport::Ssh {
            host: format!("{id}.fleet.internal"),
            user: "hearth".to_string(),
            port: 22,
        },
        role: NodeRole::Worker,
        healthy: true,
        capacity_ram_mb: capacity_mb,
        ram_overhead_factor: 1.0,
        cost_per_gb_hour: 0.01,
        labels: HashMap::new(),
        last_heartbeat: epoch_secs(),
    }
}

/// A worker running on the control-plane host itself.
pub fn local_worker_node(id: &str, capacity_mb: u64) -> NodeInfo {
    NodeInfo {
        transport: NodeTransport::Local,
        ..worker_node(id, capacity_mb)
    }
}

/// A control-plane node; never hosts workloads.
pub fn control_plane_node(id: &str, capacity_mb: u64) -> NodeInfo {
    NodeInfo {
        role: NodeRole::ControlPlane,
        ..worker_node(id, capacity_mb)
    }
}

/// A stopped workload with no node assignment.
pub fn workload(id: &str, booked_ram_mb: u64) -> WorkloadRecord {
    let now = epoch_secs();
    WorkloadRecord {
        id: id.to_string(),
        owner_id: format!("owner-{id}"),
        name: format!("{id}.play"),
        image: "itzg/minecraft-server:latest".to_string(),
        port: 25565,
        data_path: format!("/srv/hearth/{id}"),
        booked_ram_mb,
        granted_ram_mb: 0,
        status: WorkloadStatus::Stopped,
        node_id: None,
        container_id: None,
        snapshot_id: None,
        env: HashMap::new(),
        occupants: 0,
        migration: MigrationPrefs::default(),
        last_started_at: None,
        last_stopped_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

/// Load probe returning a fixed value.
#[derive(Debug, Clone, Copy)]
pub struct StaticLoad(pub Option<f64>);

impl LoadProbe for StaticLoad {
    fn load_per_core(&self) -> Option<f64> {
        self.0
    }
}

// ── Container runtime ─────────────────────────────────────────────

/// A container known to the fake runtime.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub node_id: String,
    pub spec: ContainerSpec,
    pub running: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    fail_create: HashSet<String>,
    fail_start: HashSet<String>,
    fail_ready: HashSet<String>,
    fail_stop: bool,
    fail_remove: bool,
    notices: Vec<(String, String)>,
}

/// Container runtime that keeps containers in memory.
///
/// Failures are injected per node (`fail_create_on`, ...) or globally
/// (`set_fail_stop`). The readiness gate lets a test hold a boot in
/// progress.
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    starts_on_create: bool,
    ready_gate: watch::Sender<bool>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            starts_on_create: false,
            ready_gate: watch::Sender::new(true),
        }
    }

    /// Behave like a runtime whose `create` also starts the container.
    pub fn starting_on_create(mut self) -> Self {
        self.starts_on_create = true;
        self
    }

    pub fn fail_create_on(&self, node_id: &str) {
        lock(&self.state).fail_create.insert(node_id.to_string());
    }

    pub fn fail_start_on(&self, node_id: &str) {
        lock(&self.state).fail_start.insert(node_id.to_string());
    }

    pub fn fail_ready_on(&self, node_id: &str) {
        lock(&self.state).fail_ready.insert(node_id.to_string());
    }

    pub fn set_fail_stop(&self, fail: bool) {
        lock(&self.state).fail_stop = fail;
    }

    pub fn set_fail_remove(&self, fail: bool) {
        lock(&self.state).fail_remove = fail;
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.fail_create.clear();
        state.fail_start.clear();
        state.fail_ready.clear();
        state.fail_stop = false;
        state.fail_remove = false;
    }

    /// Block `wait_ready` until [`open_ready_gate`](Self::open_ready_gate).
    pub fn close_ready_gate(&self) {
        self.ready_gate.send_replace(false);
    }

    pub fn open_ready_gate(&self) {
        self.ready_gate.send_replace(true);
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        lock(&self.state).containers.get(id).cloned()
    }

    pub fn containers_on(&self, node_id: &str) -> Vec<FakeContainer> {
        let mut found: Vec<FakeContainer> = lock(&self.state)
            .containers
            .values()
            .filter(|c| c.node_id == node_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    pub fn container_count(&self) -> usize {
        lock(&self.state).containers.len()
    }

    /// Messages sent through `notify_occupants`, as (container id, text).
    pub fn notices(&self) -> Vec<(String, String)> {
        lock(&self.state).notices.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn starts_on_create(&self) -> bool {
        self.starts_on_create
    }

    async fn create(
        &self,
        node: &NodeInfo,
        spec: &ContainerSpec,
    ) -> anyhow::Result<ContainerHandle> {
        let mut state = lock(&self.state);
        if state.fail_create.contains(&node.id) {
            bail!("create refused on {}", node.id);
        }
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                node_id: node.id.clone(),
                spec: spec.clone(),
                running: self.starts_on_create,
            },
        );
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, node: &NodeInfo, handle: &ContainerHandle) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_start.contains(&node.id) {
            bail!("start refused on {}", node.id);
        }
        match state.containers.get_mut(&handle.id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => bail!("no such container: {}", handle.id),
        }
    }

    async fn stop(
        &self,
        _node: &NodeInfo,
        handle: &ContainerHandle,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_stop {
            bail!("stop refused for {}", handle.id);
        }
        match state.containers.get_mut(&handle.id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => bail!("no such container: {}", handle.id),
        }
    }

    async fn remove(
        &self,
        _node: &NodeInfo,
        handle: &ContainerHandle,
        force: bool,
    ) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_remove {
            bail!("remove refused for {}", handle.id);
        }
        if let Some(c) = state.containers.get(&handle.id) {
            if c.running && !force {
                bail!("container {} is running", handle.id);
            }
        }
        state.containers.remove(&handle.id);
        Ok(())
    }

    async fn wait_ready(
        &self,
        node: &NodeInfo,
        handle: &ContainerHandle,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let mut gate = self.ready_gate.subscribe();
        let opened = matches!(
            tokio::time::timeout(timeout, gate.wait_for(|open| *open)).await,
            Ok(Ok(_))
        );
        if !opened {
            bail!("{} not ready after {}s", handle.id, timeout.as_secs());
        }

        let state = lock(&self.state);
        if state.fail_ready.contains(&node.id) {
            bail!("{} never became ready", handle.id);
        }
        match state.containers.get(&handle.id) {
            Some(c) if c.running => Ok(()),
            Some(_) => bail!("{} is not running", handle.id),
            None => bail!("no such container: {}", handle.id),
        }
    }

    async fn notify_occupants(
        &self,
        _node: &NodeInfo,
        handle: &ContainerHandle,
        message: &str,
    ) -> anyhow::Result<()> {
        lock(&self.state)
            .notices
            .push((handle.id.clone(), message.to_string()));
        Ok(())
    }
}

// ── Other collaborators ───────────────────────────────────────────

/// Route registrar that remembers the current table.
#[derive(Default)]
pub struct RecordingRoutes {
    routes: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl RecordingRoutes {
    pub fn address_of(&self, name: &str) -> Option<String> {
        lock(&self.routes).get(name).cloned()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RouteRegistrar for RecordingRoutes {
    async fn register_server(&self, name: &str, address: &str) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("proxy unavailable");
        }
        lock(&self.routes).insert(name.to_string(), address.to_string());
        Ok(())
    }

    async fn unregister_server(&self, name: &str) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("proxy unavailable");
        }
        lock(&self.routes).remove(name);
        Ok(())
    }
}

/// Event sink that keeps every event.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<LifecycleEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, predicate: impl Fn(&LifecycleEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for RecordingEvents {
    fn emit(&self, event: LifecycleEvent) {
        lock(&self.events).push(event);
    }
}

/// Unarchiver that records calls and can be told to fail.
#[derive(Default)]
pub struct FakeUnarchiver {
    calls: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl FakeUnarchiver {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Unarchiver for FakeUnarchiver {
    async fn unarchive(&self, workload: &WorkloadRecord) -> anyhow::Result<()> {
        lock(&self.calls).push(workload.id.clone());
        if self.failing.load(Ordering::SeqCst) {
            bail!("archive for {} is corrupt", workload.id);
        }
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────────

/// Lifecycle settings with no shutdown delay and short timeouts.
pub fn fast_lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        ready_timeout: Duration::from_secs(5),
        shutdown_notice: Duration::ZERO,
        stop_timeout: Duration::from_secs(1),
    }
}

/// A lifecycle controller wired to in-memory fakes.
pub struct Harness {
    pub state: StateStore,
    pub ledger: Arc<ResourceLedger>,
    pub boot: Arc<BootAdmissionController>,
    pub queue: Arc<StartQueue>,
    pub runtime: Arc<FakeRuntime>,
    pub routes: Arc<RecordingRoutes>,
    pub events: Arc<RecordingEvents>,
    pub unarchiver: Arc<FakeUnarchiver>,
    pub controller: Arc<WorkloadLifecycleController>,
}

impl Harness {
    pub fn new(nodes: &[NodeInfo]) -> Self {
        Self::with_load(nodes, None)
    }

    /// Build a harness whose host load probe reports `load` per core.
    pub fn with_load(nodes: &[NodeInfo], load: Option<f64>) -> Self {
        Self::build(nodes, load, FakeRuntime::new())
    }

    pub fn with_runtime(nodes: &[NodeInfo], runtime: FakeRuntime) -> Self {
        Self::build(nodes, None, runtime)
    }

    fn build(nodes: &[NodeInfo], load: Option<f64>, runtime: FakeRuntime) -> Self {
        let state = StateStore::open_in_memory().unwrap();
        let ledger = Arc::new(ResourceLedger::new());
        for node in nodes {
            state.put_node(node).unwrap();
            ledger.register_node(&node.id, node.capacity_ram_mb);
        }
        let boot = Arc::new(BootAdmissionController::with_probe(
            BootConfig::default(),
            Box::new(StaticLoad(load)),
        ));
        let queue = Arc::new(StartQueue::new());
        let runtime = Arc::new(runtime);
        let routes = Arc::new(RecordingRoutes::default());
        let events = Arc::new(RecordingEvents::default());
        let unarchiver = Arc::new(FakeUnarchiver::default());

        let controller = Arc::new(
            WorkloadLifecycleController::new(
                state.clone(),
                Arc::clone(&ledger),
                Arc::clone(&boot),
                Arc::clone(&queue),
                Runtimes::uniform(runtime.clone()),
            )
            .with_routes(routes.clone())
            .with_events(events.clone())
            .with_unarchiver(unarchiver.clone())
            .with_config(fast_lifecycle_config()),
        );

        Self {
            state,
            ledger,
            boot,
            queue,
            runtime,
            routes,
            events,
            unarchiver,
            controller,
        }
    }

    pub fn add_workload(&self, workload: &WorkloadRecord) {
        self.state.put_workload(workload).unwrap();
    }

    pub fn workload(&self, id: &str) -> WorkloadRecord {
        self.state.get_workload(id).unwrap().unwrap()
    }

    /// Poll until `check` holds, failing the test after two seconds.
    pub async fn wait_until(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check(self) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
