//! hearthgrid-scheduler: admission control and workload lifecycle.
//!
//! Starts and stops game-server workloads on fleet nodes. A start request
//! passes through, in order:
//!
//! - the boot-load heuristic (`BootAdmissionController::can_boot`)
//! - the fleet-wide boot slot (at most one boot in flight)
//! - node selection (`hearthgrid-placement`)
//! - atomic RAM allocation on the chosen node
//! - the container runtime (local or over SSH)
//!
//! Contention at any admission step parks the workload in the
//! `StartQueue`; runtime failures roll every reservation back and surface
//! an error.
//!
//! # Architecture
//!
//! ```text
//! WorkloadLifecycleController
//!   ├── StateStore (workload/node records, compare-and-set transitions)
//!   ├── BootAdmissionController (boot slot + load heuristic)
//!   ├── NodeSelector + ResourceLedger (placement, RAM accounting)
//!   ├── StartQueue (FIFO backpressure)
//!   └── Collaborators: Runtimes, RouteRegistrar, EventSink, Unarchiver
//! ```

pub mod archive;
pub mod boot;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod queue;
pub mod routing;
pub mod runtime;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use archive::Unarchiver;
pub use boot::{
    BootAdmissionController, BootConfig, BootVerdict, LoadProbe, SystemLoadProbe,
};
pub use error::{Phase, QueueReason, SchedulerError, SchedulerResult};
pub use events::{BroadcastEventSink, EventSink, LifecycleEvent, TracingEventSink};
pub use lifecycle::{
    DrainReport, LifecycleConfig, RecoveryReport, StopReason, WorkloadLifecycleController,
};
pub use queue::{QueueEntry, StartQueue};
pub use routing::{RouteRegistrar, StoreRoutes, workload_address};
pub use runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, LaunchError, Runtimes, container_name,
};
