//! Docker CLI container runtime.
//!
//! The same implementation serves local and SSH nodes; [`NodeShell`]
//! decides where the `docker` command runs.

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tracing::debug;

use hearthgrid_scheduler::{ContainerHandle, ContainerRuntime, ContainerSpec};
use hearthgrid_state::NodeInfo;

use crate::shell::NodeShell;

/// Path of the world data inside the game-server container.
const CONTAINER_DATA_DIR: &str = "/data";
const READY_POLL: Duration = Duration::from_secs(2);

pub struct DockerRuntime {
    name: &'static str,
    shell: NodeShell,
    docker_bin: String,
    image_default: String,
}

impl DockerRuntime {
    pub fn new(
        name: &'static str,
        shell: NodeShell,
        docker_bin: impl Into<String>,
        image_default: impl Into<String>,
    ) -> Self {
        Self {
            name,
            shell,
            docker_bin: docker_bin.into(),
            image_default: image_default.into(),
        }
    }

    async fn docker(&self, node: &NodeInfo, args: Vec<String>) -> anyhow::Result<String> {
        self.shell.run(node, &self.docker_bin, &args).await
    }

    /// Arguments for `docker create`.
    pub fn create_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--memory".to_string(),
            format!("{}m", spec.ram_mb),
            "--publish".to_string(),
            format!("{0}:{0}", spec.port),
            "--volume".to_string(),
            format!("{}:{CONTAINER_DATA_DIR}", spec.data_path),
            "--env".to_string(),
            format!("MEMORY={}M", spec.ram_mb),
        ];

        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(if spec.image.is_empty() {
            self.image_default.clone()
        } else {
            spec.image.clone()
        });
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn create(&self, node: &NodeInfo, spec: &ContainerSpec) -> anyhow::Result<ContainerHandle> {
        let id = self.docker(node, self.create_args(spec)).await?;
        if id.is_empty() {
            bail!("docker create returned no container id");
        }
        debug!(node = %node.id, container = %id, name = %spec.name, "container created");
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, node: &NodeInfo, handle: &ContainerHandle) -> anyhow::Result<()> {
        self.docker(node, vec!["start".to_string(), handle.id.clone()])
            .await
            .map(|_| ())
    }

    async fn stop(
        &self,
        node: &NodeInfo,
        handle: &ContainerHandle,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        self.docker(
            node,
            vec![
                "stop".to_string(),
                "--time".to_string(),
                timeout.as_secs().to_string(),
                handle.id.clone(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, node: &NodeInfo, handle: &ContainerHandle, force: bool) -> anyhow::Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(handle.id.clone());
        self.docker(node, args).await.map(|_| ())
    }

    /// Poll the container until it runs and, if it has a health check,
    /// reports healthy.
    async fn wait_ready(
        &self,
        node: &NodeInfo,
        handle: &ContainerHandle,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self
                .docker(
                    node,
                    vec![
                        "inspect".to_string(),
                        "--format".to_string(),
                        "{{.State.Status}} {{if .State.Health}}{{.State.Health.Status}}{{end}}"
                            .to_string(),
                        handle.id.clone(),
                    ],
                )
                .await?;
            match parse_state(&state) {
                Readiness::Ready => return Ok(()),
                Readiness::Dead(status) => bail!("container {} is {status}", handle.id),
                Readiness::Pending => {}
            }
            if tokio::time::Instant::now() + READY_POLL > deadline {
                bail!("container {} not ready after {}s", handle.id, timeout.as_secs());
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn notify_occupants(
        &self,
        node: &NodeInfo,
        handle: &ContainerHandle,
        message: &str,
    ) -> anyhow::Result<()> {
        self.docker(
            node,
            vec![
                "exec".to_string(),
                handle.id.clone(),
                "rcon-cli".to_string(),
                "say".to_string(),
                message.to_string(),
            ],
        )
        .await
        .map(|_| ())
    }
}

#[derive(Debug, PartialEq)]
enum Readiness {
    Ready,
    Pending,
    Dead(String),
}

/// Interpret `docker inspect` output of the form `<status> [<health>]`.
fn parse_state(raw: &str) -> Readiness {
    let mut parts = raw.split_whitespace();
    let status = parts.next().unwrap_or_default();
    let health = parts.next();
    match (status, health) {
        ("running", None | Some("healthy")) => Readiness::Ready,
        ("running", Some("unhealthy")) => Readiness::Dead("unhealthy".to_string()),
        ("running", Some(_)) | ("created" | "restarting", _) => Readiness::Pending,
        (other, _) => Readiness::Dead(other.to_string()),
    }
}
