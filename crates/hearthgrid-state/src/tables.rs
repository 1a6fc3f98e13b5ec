//! redb table definitions for the HearthGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Shape shared by every table: string key, JSON value.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Node info keyed by `{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Workload records keyed by `{workload_id}`.
pub const WORKLOADS: JsonTable = TableDefinition::new("workloads");

/// Migration records keyed by `{migration_id}`.
pub const MIGRATIONS: JsonTable = TableDefinition::new("migrations");

/// Client-facing route entries keyed by `{server_name}`.
pub const ROUTES: JsonTable = TableDefinition::new("routes");
