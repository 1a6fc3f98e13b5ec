//! HearthGrid placement: RAM accounting and node selection.
//!
//! This crate decides *where* a workload may run. It does NOT start
//! containers (that's `hearthgrid-scheduler`). It keeps the per-node RAM
//! ledger and ranks candidate nodes for a RAM requirement.
//!
//! # Components
//!
//! - **`ledger`**: Linearizable per-node reserve/release of booked RAM
//! - **`scorer`**: Placement strategies (best-fit, worst-fit, first-fit)
//! - **`selector`**: Filters healthy, hostable nodes and picks a target

pub mod error;
pub mod ledger;
pub mod scorer;
pub mod selector;

pub use error::{PlacementError, PlacementResult};
pub use ledger::{NodeLedger, RebuildReport, ResourceLedger};
pub use scorer::{NodeCandidate, NodeScore, PlacementStrategy, rank_candidates, score_candidate};
pub use selector::NodeSelector;
