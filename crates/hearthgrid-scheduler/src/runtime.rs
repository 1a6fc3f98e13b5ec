//! Container runtime abstraction.
//!
//! The scheduler never talks to Docker (or anything else) directly. A
//! [`ContainerRuntime`] drives containers on one class of node; [`Runtimes`]
//! routes each call to the local or remote implementation based on the
//! node's transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use hearthgrid_state::{NodeInfo, WorkloadRecord};

use crate::error::Phase;

/// Everything a runtime needs to create a workload container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name, unique per workload.
    pub name: String,
    pub image: String,
    /// Memory limit handed to the container (MB).
    pub ram_mb: u64,
    pub port: u16,
    /// Host directory mounted as the server's data directory.
    pub data_path: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Build the container spec for `workload` on `node`.
    ///
    /// The memory limit is the booked RAM adjusted by the node's overhead
    /// factor.
    pub fn for_workload(workload: &WorkloadRecord, node: &NodeInfo) -> Self {
        let mut labels = HashMap::new();
        labels.insert("hearthgrid.workload".to_string(), workload.id.clone());
        labels.insert("hearthgrid.owner".to_string(), workload.owner_id.clone());

        Self {
            name: container_name(&workload.id),
            image: workload.image.clone(),
            ram_mb: node.granted_ram_mb(workload.booked_ram_mb),
            port: workload.port,
            data_path: workload.data_path.clone(),
            env: workload.env.clone(),
            labels,
        }
    }
}

/// Container name used for a workload on any node.
pub fn container_name(workload_id: &str) -> String {
    format!("hearth-{workload_id}")
}

/// Opaque handle to a created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Drives containers on fleet nodes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether `create` already starts the container, making `start` a no-op.
    fn starts_on_create(&self) -> bool {
        false
    }

    async fn create(&self, node: &NodeInfo, spec: &ContainerSpec)
        -> anyhow::Result<ContainerHandle>;

    async fn start(&self, node: &NodeInfo, handle: &ContainerHandle) -> anyhow::Result<()>;

    /// Stop the container, giving the server `timeout` to exit cleanly.
    async fn stop(
        &self,
        node: &NodeInfo,
        handle: &ContainerHandle,
        timeout: Duration,
    ) -> anyhow::Result<()>;

    async fn remove(&self, node: &NodeInfo, handle: &ContainerHandle, force: bool)
        -> anyhow::Result<()>;

    /// Wait until the server accepts connections, or fail after `timeout`.
    async fn wait_ready(
        &self,
        node: &NodeInfo,
        handle: &ContainerHandle,
        timeout: Duration,
    ) -> anyhow::Result<()>;

    /// Send an in-game message to connected players.
    async fn notify_occupants(
        &self,
        _node: &NodeInfo,
        _handle: &ContainerHandle,
        _message: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A failed create/start, with the container left behind (if any) so the
/// caller can clean it up.
#[derive(Debug)]
pub struct LaunchError {
    pub phase: Phase,
    pub handle: Option<ContainerHandle>,
    pub source: anyhow::Error,
}

/// Local and remote runtimes, selected per node.
#[derive(Clone)]
pub struct Runtimes {
    local: Arc<dyn ContainerRuntime>,
    remote: Arc<dyn ContainerRuntime>,
}

impl Runtimes {
    pub fn new(local: Arc<dyn ContainerRuntime>, remote: Arc<dyn ContainerRuntime>) -> Self {
        Self { local, remote }
    }

    /// Use the same runtime for every node.
    pub fn uniform(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            local: Arc::clone(&runtime),
            remote: runtime,
        }
    }

    pub fn for_node(&self, node: &NodeInfo) -> &Arc<dyn ContainerRuntime> {
        if node.is_local() { &self.local } else { &self.remote }
    }

    /// Create and start a container for `spec` on `node`.
    pub async fn launch(
        &self,
        node: &NodeInfo,
        spec: &ContainerSpec,
    ) -> Result<ContainerHandle, LaunchError> {
        let runtime = self.for_node(node);
        let handle = runtime
            .create(node, spec)
            .await
            .map_err(|source| LaunchError {
                phase: Phase::Create,
                handle: None,
                source,
            })?;

        if !runtime.starts_on_create() {
            if let Err(source) = runtime.start(node, &handle).await {
                return Err(LaunchError {
                    phase: Phase::Start,
                    handle: Some(handle),
                    source,
                });
            }
        }
        Ok(handle)
    }

    /// Force-remove a container, logging instead of failing.
    pub async fn discard(&self, node: &NodeInfo, handle: &ContainerHandle) {
        if let Err(e) = self.for_node(node).remove(node, handle, true).await {
            warn!(
                node = %node.id,
                container = %handle.id,
                error = %e,
                "failed to remove container"
            );
        }
    }
}
