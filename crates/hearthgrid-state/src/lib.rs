//! hearthgrid-state: embedded state store for HearthGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for nodes, workloads, migrations, and routes.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Status fields are closed enums carrying their own transition tables;
//! the store applies transitions as compare-and-set operations inside a
//! single write transaction, so concurrent callers can never both claim
//! the same state change.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, Transition, epoch_secs};
pub use types::*;
