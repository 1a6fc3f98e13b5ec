//! Domain types for the HearthGrid state store.
//!
//! These types represent the persisted state of nodes, workloads,
//! migrations, and client-facing routes. All types are serializable
//! to/from JSON for storage in redb tables.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the fleet.
pub type NodeId = String;

/// Unique identifier for a hosted workload (one game server).
pub type WorkloadId = String;

/// Unique identifier for a migration record.
pub type MigrationId = String;

/// Identifier of the account that owns a workload.
pub type OwnerId = String;

// ── Node ──────────────────────────────────────────────────────────

/// Whether a node may receive workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Regular worker host.
    #[default]
    Worker,
    /// Control-plane/system host. Never receives workloads, but has
    /// direct access to the snapshot store.
    ControlPlane,
}

/// How the control plane reaches a node's container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeTransport {
    /// The runtime runs on the same host as the control plane.
    Local,
    /// The runtime is driven over SSH.
    Ssh { host: String, user: String, port: u16 },
}

/// Information about a node in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Address clients use to reach workloads on this node.
    pub address: String,
    pub transport: NodeTransport,
    pub role: NodeRole,
    pub healthy: bool,
    /// Total RAM bookable on this node (MB).
    pub capacity_ram_mb: u64,
    /// Fraction of booked RAM actually handed to the container.
    pub ram_overhead_factor: f64,
    /// Hourly price of one GB of RAM on this node, used by the cost advisor.
    pub cost_per_gb_hour: f64,
    /// Arbitrary labels (region, provider, ...).
    pub labels: HashMap<String, String>,
    /// Unix timestamp of the last heartbeat or health update.
    pub last_heartbeat: u64,
}

impl NodeInfo {
    /// Control-plane nodes never receive workloads.
    pub fn is_hostable(&self) -> bool {
        self.role == NodeRole::Worker
    }

    pub fn is_local(&self) -> bool {
        self.transport == NodeTransport::Local
    }

    /// RAM the container actually receives for a booking of `booked_mb`.
    ///
    /// Factors outside `(0, 1]` are treated as 1.0.
    pub fn granted_ram_mb(&self, booked_mb: u64) -> u64 {
        let factor = if self.ram_overhead_factor > 0.0 && self.ram_overhead_factor <= 1.0 {
            self.ram_overhead_factor
        } else {
            1.0
        };
        (booked_mb as f64 * factor).floor() as u64
    }

    /// Host name used for data transfer and remote runtime calls.
    pub fn transfer_host(&self) -> &str {
        match &self.transport {
            NodeTransport::Local => "localhost",
            NodeTransport::Ssh { host, .. } => host,
        }
    }
}

// ── Workload ──────────────────────────────────────────────────────

/// Lifecycle status of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Queued,
    Starting,
    Running,
    Stopping,
    Stopped,
    Sleeping,
    Archived,
    Error,
}

impl WorkloadStatus {
    /// Transition table for workload lifecycle changes.
    pub fn can_transition_to(self, next: WorkloadStatus) -> bool {
        use WorkloadStatus::*;
        matches!(
            (self, next),
            (Stopped | Sleeping, Starting | Queued | Archived)
                | (Archived, Starting)
                | (Queued, Starting | Stopped)
                | (Starting, Running | Queued | Error)
                | (Running, Stopping)
                | (Stopping, Stopped | Sleeping | Error)
                | (Error, Starting | Stopped)
        )
    }

    /// Statuses from which a start request may be accepted.
    pub fn is_startable(self) -> bool {
        matches!(
            self,
            WorkloadStatus::Stopped
                | WorkloadStatus::Sleeping
                | WorkloadStatus::Archived
                | WorkloadStatus::Error
        )
    }

    /// Statuses during which the workload's booked RAM is charged to its node.
    pub fn holds_resources(self) -> bool {
        matches!(
            self,
            WorkloadStatus::Starting | WorkloadStatus::Running | WorkloadStatus::Stopping
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadStatus::Queued => "queued",
            WorkloadStatus::Starting => "starting",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopping => "stopping",
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Sleeping => "sleeping",
            WorkloadStatus::Archived => "archived",
            WorkloadStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may initiate migrations of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Only operator-requested migrations.
    #[default]
    Manual,
    /// The cost advisor records suggestions that need approval.
    Suggest,
    /// The cost advisor schedules migrations directly.
    Auto,
}

/// How aggressively the cost advisor looks for cheaper placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CostOptimizationLevel {
    #[default]
    Off,
    Conservative,
    Aggressive,
}

impl CostOptimizationLevel {
    /// Minimum relative saving that justifies a cost-driven migration.
    pub fn min_savings_ratio(self) -> Option<f64> {
        match self {
            CostOptimizationLevel::Off => None,
            CostOptimizationLevel::Conservative => Some(0.20),
            CostOptimizationLevel::Aggressive => Some(0.05),
        }
    }
}

/// Per-workload migration eligibility flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationPrefs {
    pub allow_migration: bool,
    pub mode: MigrationMode,
    pub cost_optimization: CostOptimizationLevel,
}

impl Default for MigrationPrefs {
    fn default() -> Self {
        Self {
            allow_migration: true,
            mode: MigrationMode::Manual,
            cost_optimization: CostOptimizationLevel::Off,
        }
    }
}

/// A hosted game-server instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadRecord {
    pub id: WorkloadId,
    pub owner_id: OwnerId,
    /// Server name clients connect with; also the routing key.
    pub name: String,
    /// Container image to run.
    pub image: String,
    /// Port the game server listens on.
    pub port: u16,
    /// Directory holding the world data on the workload's node.
    pub data_path: String,
    /// RAM requirement booked against the node ledger (MB).
    pub booked_ram_mb: u64,
    /// RAM handed to the container after overhead adjustment (MB).
    pub granted_ram_mb: u64,
    pub status: WorkloadStatus,
    /// Node the workload runs on, or last ran on (where its data lives).
    pub node_id: Option<NodeId>,
    /// Runtime handle of the current container, if one exists.
    pub container_id: Option<String>,
    /// Latest snapshot in the snapshot store, if any.
    pub snapshot_id: Option<String>,
    pub env: HashMap<String, String>,
    /// Connected players as last reported.
    pub occupants: u32,
    pub migration: MigrationPrefs,
    pub last_started_at: Option<u64>,
    pub last_stopped_at: Option<u64>,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl WorkloadRecord {
    /// Whether the workload's booked RAM is currently charged to `node_id`.
    ///
    /// An errored workload whose container could not be stopped still holds
    /// its allocation until it is reclaimed.
    pub fn holds_allocation(&self) -> bool {
        self.node_id.is_some()
            && (self.status.holds_resources()
                || (self.status == WorkloadStatus::Error && self.container_id.is_some()))
    }
}

// ── Migration ─────────────────────────────────────────────────────

/// Status of a migration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Suggested,
    Scheduled,
    Preparing,
    Transferring,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    /// Transition table for the migration protocol.
    ///
    /// `Failed → Scheduled` is the retry edge; its retry bound is enforced by
    /// [`MigrationRecord::can_retry`].
    pub fn can_transition_to(self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Suggested, Scheduled | Cancelled)
                | (Scheduled, Preparing | Cancelled)
                | (Preparing, Transferring | Failed)
                | (Transferring, Completing)
                | (Completing, Completed)
                | (Failed, Scheduled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Suggested => "suggested",
            MigrationStatus::Scheduled => "scheduled",
            MigrationStatus::Preparing => "preparing",
            MigrationStatus::Transferring => "transferring",
            MigrationStatus::Completing => "completing",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a migration was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationReason {
    Manual,
    CostOptimization,
}

/// A relocation of one workload from its node to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub workload_id: WorkloadId,
    pub source_node_id: NodeId,
    /// Requested or chosen target. `None` lets the selector pick.
    pub target_node_id: Option<NodeId>,
    /// The target was requested explicitly and is kept across retries.
    #[serde(default)]
    pub target_pinned: bool,
    pub status: MigrationStatus,
    pub reason: MigrationReason,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest Unix time at which the migration may run.
    pub scheduled_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub occupants_at_start: u32,
    /// Estimated monthly saving for cost-driven migrations.
    pub estimated_monthly_savings: f64,
    /// Source container being replaced, captured when Preparing starts.
    #[serde(default)]
    pub source_container_id: Option<String>,
    /// Container created on the target during Preparing.
    pub target_container_id: Option<String>,
    /// RAM charged to the target node during Preparing (MB).
    pub target_ram_mb: u64,
    /// Non-fatal problems from Transferring/Completing.
    pub warnings: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl MigrationRecord {
    /// A new migration due at `scheduled_at`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<MigrationId>,
        workload_id: impl Into<WorkloadId>,
        source_node_id: impl Into<NodeId>,
        target_node_id: Option<NodeId>,
        reason: MigrationReason,
        max_retries: u32,
        scheduled_at: u64,
        now: u64,
    ) -> Self {
        Self {
            id: id.into(),
            workload_id: workload_id.into(),
            source_node_id: source_node_id.into(),
            target_pinned: target_node_id.is_some(),
            target_node_id,
            status: MigrationStatus::Scheduled,
            reason,
            retry_count: 0,
            max_retries,
            scheduled_at,
            started_at: None,
            completed_at: None,
            occupants_at_start: 0,
            estimated_monthly_savings: 0.0,
            source_container_id: None,
            target_container_id: None,
            target_ram_mb: 0,
            warnings: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the bounded retry edge `Failed → Scheduled` is still open.
    pub fn can_retry(&self) -> bool {
        self.status == MigrationStatus::Failed && self.retry_count < self.max_retries
    }
}

// ── Routes ────────────────────────────────────────────────────────

/// Client-facing routing entry consumed by the connection proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteEntry {
    pub name: String,
    /// Backend address (host:port).
    pub address: String,
    pub updated_at: u64,
}
