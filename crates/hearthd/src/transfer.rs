//! rsync/tar data transfer and snapshot restore.

use std::path::PathBuf;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use hearthgrid_migrate::DataTransfer;
use hearthgrid_scheduler::Unarchiver;
use hearthgrid_state::{NodeInfo, NodeTransport, StateStore, WorkloadRecord};

use crate::shell::{NodeShell, run_command, shell_quote};

/// Moves data with rsync. Node-to-node copies run on the source node;
/// snapshot archives are pushed from the control plane.
#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    shell: NodeShell,
    ssh_bin: String,
    rsync_bin: String,
    snapshot_dir: PathBuf,
}

impl RsyncTransfer {
    pub fn new(
        shell: NodeShell,
        ssh_bin: impl Into<String>,
        rsync_bin: impl Into<String>,
        snapshot_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shell,
            ssh_bin: ssh_bin.into(),
            rsync_bin: rsync_bin.into(),
            snapshot_dir: snapshot_dir.into(),
        }
    }

    pub fn archive_path(&self, snapshot_id: &str) -> PathBuf {
        self.snapshot_dir.join(format!("{snapshot_id}.tar.gz"))
    }

    /// rsync arguments copying `path` from the source to `target`.
    pub fn sync_args(&self, target: &NodeInfo, path: &str) -> Vec<String> {
        let dir = format!("{}/", path.trim_end_matches('/'));
        let mut args = vec!["-a".to_string(), "--delete".to_string()];
        if let NodeTransport::Ssh { host, user, port } = &target.transport {
            args.push("-e".to_string());
            args.push(format!("{} -p {port} -o BatchMode=yes", self.ssh_bin));
            args.push(dir.clone());
            args.push(format!("{user}@{host}:{dir}"));
        } else {
            args.push(dir.clone());
            args.push(dir);
        }
        args
    }
}

#[async_trait]
impl DataTransfer for RsyncTransfer {
    async fn sync_directory(
        &self,
        source: &NodeInfo,
        target: &NodeInfo,
        path: &str,
    ) -> anyhow::Result<()> {
        if target.is_local() {
            if source.is_local() {
                debug!(path, "source and target share the host, nothing to copy");
                return Ok(());
            }
            bail!(
                "cannot sync from remote node {} into the control-plane host",
                source.id
            );
        }
        info!(source = %source.id, target = %target.id, path, "syncing data directory");
        self.shell
            .run(source, &self.rsync_bin, &self.sync_args(target, path))
            .await
            .map(|_| ())
    }

    async fn restore_snapshot(
        &self,
        snapshot_id: &str,
        target: &NodeInfo,
        path: &str,
    ) -> anyhow::Result<()> {
        let archive = self.archive_path(snapshot_id);
        if !archive.is_file() {
            bail!("snapshot archive {} not found", archive.display());
        }
        info!(snapshot_id, target = %target.id, path, "restoring snapshot");

        let staged = match &target.transport {
            NodeTransport::Local => archive.display().to_string(),
            NodeTransport::Ssh { host, user, port } => {
                let staged = format!("{}.restore.tar.gz", path.trim_end_matches('/'));
                let mut cmd = Command::new(&self.rsync_bin);
                cmd.arg("-e")
                    .arg(format!("{} -p {port} -o BatchMode=yes", self.ssh_bin))
                    .arg(&archive)
                    .arg(format!("{user}@{host}:{staged}"));
                run_command(cmd)
                    .await
                    .with_context(|| format!("uploading snapshot {snapshot_id} to {}", target.id))?;
                staged
            }
        };

        let mut script = format!(
            "mkdir -p {dir} && tar -xzf {staged} -C {dir}",
            dir = shell_quote(path),
            staged = shell_quote(&staged),
        );
        if !target.is_local() {
            script.push_str(&format!(" && rm -f {}", shell_quote(&staged)));
        }
        self.shell
            .run(target, "sh", &["-c".to_string(), script])
            .await
            .map(|_| ())
    }
}

/// Restores archived workloads onto their home node from the snapshot store.
pub struct SnapshotUnarchiver {
    state: StateStore,
    transfer: RsyncTransfer,
}

impl SnapshotUnarchiver {
    pub fn new(state: StateStore, transfer: RsyncTransfer) -> Self {
        Self { state, transfer }
    }
}

#[async_trait]
impl Unarchiver for SnapshotUnarchiver {
    async fn unarchive(&self, workload: &WorkloadRecord) -> anyhow::Result<()> {
        let Some(snapshot_id) = &workload.snapshot_id else {
            bail!("archived workload {} has no snapshot", workload.id);
        };
        let Some(node_id) = &workload.node_id else {
            bail!("archived workload {} has no home node", workload.id);
        };
        let node = self
            .state
            .get_node(node_id)?
            .with_context(|| format!("home node {node_id} not found"))?;
        self.transfer
            .restore_snapshot(snapshot_id, &node, &workload.data_path)
            .await
    }
}
