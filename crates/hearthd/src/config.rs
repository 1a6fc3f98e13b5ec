//! hearthd.toml configuration.
//!
//! Every section and field is optional; missing values fall back to the
//! library defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use hearthgrid_migrate::MigrationConfig;
use hearthgrid_placement::PlacementStrategy;
use hearthgrid_scheduler::{BootConfig, LifecycleConfig};
use hearthgrid_state::{NodeInfo, NodeRole, NodeTransport, epoch_secs};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    pub daemon: DaemonSection,
    pub boot: BootSection,
    pub lifecycle: LifecycleSection,
    pub migration: MigrationSection,
    pub runtime: RuntimeSection,
    pub nodes: Vec<NodeSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub data_dir: PathBuf,
    pub queue_poll_secs: u64,
    pub migration_poll_secs: u64,
    pub advisor_interval_secs: u64,
    pub placement_strategy: PlacementStrategy,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/hearthgrid"),
            queue_poll_secs: 15,
            migration_poll_secs: 30,
            advisor_interval_secs: 300,
            placement_strategy: PlacementStrategy::BestFit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootSection {
    pub max_load_per_core: f64,
    pub heavy_load_per_core: f64,
    pub heavy_boot_ram_mb: u64,
    pub slot_ttl_secs: u64,
}

impl Default for BootSection {
    fn default() -> Self {
        let d = BootConfig::default();
        Self {
            max_load_per_core: d.max_load_per_core,
            heavy_load_per_core: d.heavy_load_per_core,
            heavy_boot_ram_mb: d.heavy_boot_ram_mb,
            slot_ttl_secs: d.slot_ttl.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub ready_timeout_secs: u64,
    pub shutdown_notice_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        let d = LifecycleConfig::default();
        Self {
            ready_timeout_secs: d.ready_timeout.as_secs(),
            shutdown_notice_secs: d.shutdown_notice.as_secs(),
            stop_timeout_secs: d.stop_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    pub max_retries: u32,
    pub min_dwell_secs: u64,
    pub retry_backoff_secs: u64,
    pub ready_timeout_secs: u64,
}

impl Default for MigrationSection {
    fn default() -> Self {
        let d = MigrationConfig::default();
        Self {
            max_retries: d.max_retries,
            min_dwell_secs: d.min_dwell.as_secs(),
            retry_backoff_secs: d.retry_backoff.as_secs(),
            ready_timeout_secs: d.ready_timeout.as_secs(),
        }
    }
}

/// External tools and paths used by the concrete collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub docker_bin: String,
    pub ssh_bin: String,
    pub rsync_bin: String,
    /// Directory on the control plane holding `<snapshot_id>.tar.gz` archives.
    pub snapshot_dir: PathBuf,
    /// Image used for workloads that do not name one.
    pub image_default: String,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            ssh_bin: "ssh".to_string(),
            rsync_bin: "rsync".to_string(),
            snapshot_dir: PathBuf::from("/var/lib/hearthgrid/snapshots"),
            image_default: "itzg/minecraft-server:latest".to_string(),
        }
    }
}

/// A seed node, upserted into the store at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub role: NodeRole,
    pub capacity_ram_mb: u64,
    #[serde(default = "default_overhead")]
    pub ram_overhead_factor: f64,
    #[serde(default)]
    pub cost_per_gb_hour: f64,
    /// `user@host[:port]` for nodes driven over SSH; absent for the local host.
    #[serde(default)]
    pub ssh: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_overhead() -> f64 {
    1.0
}

impl HearthConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: HearthConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                bail!("node {} is declared twice", node.id);
            }
            if !(node.ram_overhead_factor > 0.0 && node.ram_overhead_factor <= 1.0) {
                bail!(
                    "node {}: ram_overhead_factor must be in (0, 1], got {}",
                    node.id,
                    node.ram_overhead_factor
                );
            }
            node.transport()?;
        }
        if self.boot.heavy_load_per_core > self.boot.max_load_per_core {
            bail!("boot.heavy_load_per_core must not exceed boot.max_load_per_core");
        }
        Ok(())
    }

    pub fn boot_config(&self) -> BootConfig {
        BootConfig {
            max_load_per_core: self.boot.max_load_per_core,
            heavy_load_per_core: self.boot.heavy_load_per_core,
            heavy_boot_ram_mb: self.boot.heavy_boot_ram_mb,
            slot_ttl: Duration::from_secs(self.boot.slot_ttl_secs),
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            ready_timeout: Duration::from_secs(self.lifecycle.ready_timeout_secs),
            shutdown_notice: Duration::from_secs(self.lifecycle.shutdown_notice_secs),
            stop_timeout: Duration::from_secs(self.lifecycle.stop_timeout_secs),
        }
    }

    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            max_retries: self.migration.max_retries,
            min_dwell: Duration::from_secs(self.migration.min_dwell_secs),
            retry_backoff: Duration::from_secs(self.migration.retry_backoff_secs),
            ready_timeout: Duration::from_secs(self.migration.ready_timeout_secs),
        }
    }
}

impl NodeSection {
    pub fn transport(&self) -> anyhow::Result<NodeTransport> {
        let Some(target) = &self.ssh else {
            return Ok(NodeTransport::Local);
        };
        let Some((user, rest)) = target.split_once('@') else {
            bail!("node {}: ssh must be user@host[:port], got {target}", self.id);
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .with_context(|| format!("node {}: bad ssh port {port}", self.id))?,
            ),
            None => (rest, 22),
        };
        if user.is_empty() || host.is_empty() {
            bail!("node {}: ssh must be user@host[:port], got {target}", self.id);
        }
        Ok(NodeTransport::Ssh {
            host: host.to_string(),
            user: user.to_string(),
            port,
        })
    }

    pub fn to_node_info(&self) -> anyhow::Result<NodeInfo> {
        Ok(NodeInfo {
            id: self.id.clone(),
            address: self.address.clone(),
            transport: self.transport()?,
            role: self.role,
            healthy: true,
            capacity_ram_mb: self.capacity_ram_mb,
            ram_overhead_factor: self.ram_overhead_factor,
            cost_per_gb_hour: self.cost_per_gb_hour,
            labels: self.labels.clone(),
            last_heartbeat: epoch_secs(),
        })
    }
}
