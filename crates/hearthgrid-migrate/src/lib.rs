//! hearthgrid-migrate: live and offline workload relocation.
//!
//! A migration moves a workload's data, container and client route from
//! its node to another through three phases:
//!
//! - **Preparing**: reserve RAM on the target, copy the data, boot a new
//!   container and wait for it. Any failure is rolled back completely and
//!   the migration is retried a bounded number of times.
//! - **Transferring**: point the client route at the target. From here on
//!   the migration always completes.
//! - **Completing**: tear down the source container, release its RAM and
//!   reassign the workload. Cleanup problems become warnings.
//!
//! Stopped and sleeping workloads are migrated data-only: nothing is
//! booted and no route changes.
//!
//! # Architecture
//!
//! ```text
//! MigrationOrchestrator
//!   ├── WorkloadLifecycleController (state, ledger, selector, runtimes, routes)
//!   ├── DataTransfer (rsync / snapshot restore)
//!   └── machine (phase transitions, bounded retry)
//! CostAdvisor ──> MigrationOrchestrator (suggest / schedule)
//! ```

pub mod admission;
pub mod advisor;
pub mod error;
pub mod machine;
pub mod orchestrator;
pub mod transfer;

pub use admission::{Ineligible, MigrationConfig, can_execute};
pub use advisor::{AdvisorReport, CostAdvice, CostAdvisor, monthly_cost};
pub use error::{MigrateError, MigrateResult};
pub use machine::FailureOutcome;
pub use orchestrator::{MigrationOrchestrator, MigrationRecoveryReport, MigrationRequest};
pub use transfer::{DataTransfer, TransferPlan, plan_transfer};
