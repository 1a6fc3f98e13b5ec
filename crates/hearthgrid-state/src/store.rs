//! StateStore: redb-backed state persistence for HearthGrid.
//!
//! Provides typed CRUD operations over nodes, workloads, migrations and
//! routes, plus compare-and-set status transitions. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! redb serializes write transactions, so every read-check-write performed
//! inside one `begin_write()` is atomic with respect to other writers.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Outcome of a compare-and-set transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<T> {
    /// The guard held and the new state was written.
    Applied(T),
    /// The guard failed; carries the unchanged current record.
    Rejected(T),
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Transition::Applied(v) | Transition::Rejected(v) => v,
        }
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
        txn.open_table(ROUTES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &NodeInfo) -> StateResult<()> {
        self.put_json(NODES, &node.id, node)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        self.get_json(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<NodeInfo>> {
        self.list_json(NODES)
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete_key(NODES, node_id)
    }

    /// Flip a node's health flag.
    pub fn set_node_health(&self, node_id: &str, healthy: bool) -> StateResult<NodeInfo> {
        let now = epoch_secs();
        self.modify_json(NODES, node_id, |n: &mut NodeInfo| {
            n.healthy = healthy;
            n.last_heartbeat = now;
            true
        })?
        .map(|(_, n)| n)
        .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert or update a workload record.
    pub fn put_workload(&self, workload: &WorkloadRecord) -> StateResult<()> {
        self.put_json(WORKLOADS, &workload.id, workload)
    }

    pub fn get_workload(&self, id: &str) -> StateResult<Option<WorkloadRecord>> {
        self.get_json(WORKLOADS, id)
    }

    pub fn list_workloads(&self) -> StateResult<Vec<WorkloadRecord>> {
        self.list_json(WORKLOADS)
    }

    /// List workloads whose status is one of `statuses`.
    pub fn list_workloads_by_status(
        &self,
        statuses: &[WorkloadStatus],
    ) -> StateResult<Vec<WorkloadRecord>> {
        Ok(self
            .list_workloads()?
            .into_iter()
            .filter(|w| statuses.contains(&w.status))
            .collect())
    }

    /// Delete a workload by ID. Returns true if it existed.
    pub fn delete_workload(&self, id: &str) -> StateResult<bool> {
        self.delete_key(WORKLOADS, id)
    }

    /// Atomically move a workload from one of `from` to `to`.
    ///
    /// The transition is applied only if the current status is in `from`
    /// and the move is legal per [`WorkloadStatus::can_transition_to`].
    /// `update` runs on the record inside the same write transaction.
    pub fn transition_workload<F>(
        &self,
        id: &str,
        from: &[WorkloadStatus],
        to: WorkloadStatus,
        update: F,
    ) -> StateResult<Transition<WorkloadRecord>>
    where
        F: FnOnce(&mut WorkloadRecord),
    {
        let now = epoch_secs();
        let outcome = self.modify_json(WORKLOADS, id, |w: &mut WorkloadRecord| {
            if !from.contains(&w.status) || !w.status.can_transition_to(to) {
                return false;
            }
            w.status = to;
            w.updated_at = now;
            update(w);
            true
        })?;
        match outcome {
            Some((true, w)) => {
                debug!(workload_id = %id, status = %to, "workload transitioned");
                Ok(Transition::Applied(w))
            }
            Some((false, w)) => Ok(Transition::Rejected(w)),
            None => Err(StateError::NotFound(format!("workload {id}"))),
        }
    }

    /// Read-modify-write a workload without a status guard.
    pub fn update_workload<F>(&self, id: &str, update: F) -> StateResult<WorkloadRecord>
    where
        F: FnOnce(&mut WorkloadRecord),
    {
        let now = epoch_secs();
        self.modify_json(WORKLOADS, id, |w: &mut WorkloadRecord| {
            update(w);
            w.updated_at = now;
            true
        })?
        .map(|(_, w)| w)
        .ok_or_else(|| StateError::NotFound(format!("workload {id}")))
    }

    // ── Migrations ─────────────────────────────────────────────────

    /// Insert or update a migration record.
    pub fn put_migration(&self, migration: &MigrationRecord) -> StateResult<()> {
        self.put_json(MIGRATIONS, &migration.id, migration)
    }

    pub fn get_migration(&self, id: &str) -> StateResult<Option<MigrationRecord>> {
        self.get_json(MIGRATIONS, id)
    }

    pub fn list_migrations(&self) -> StateResult<Vec<MigrationRecord>> {
        self.list_json(MIGRATIONS)
    }

    pub fn list_migrations_for_workload(
        &self,
        workload_id: &str,
    ) -> StateResult<Vec<MigrationRecord>> {
        Ok(self
            .list_migrations()?
            .into_iter()
            .filter(|m| m.workload_id == workload_id)
            .collect())
    }

    pub fn list_migrations_by_status(
        &self,
        statuses: &[MigrationStatus],
    ) -> StateResult<Vec<MigrationRecord>> {
        Ok(self
            .list_migrations()?
            .into_iter()
            .filter(|m| statuses.contains(&m.status))
            .collect())
    }

    /// Scheduled migrations whose `scheduled_at` is due, oldest first.
    pub fn find_pending_migrations(&self, now: u64) -> StateResult<Vec<MigrationRecord>> {
        let mut due: Vec<MigrationRecord> = self
            .list_migrations()?
            .into_iter()
            .filter(|m| m.status == MigrationStatus::Scheduled && m.scheduled_at <= now)
            .collect();
        due.sort_by_key(|m| (m.scheduled_at, m.created_at));
        Ok(due)
    }

    /// Whether the workload has any non-terminal migration.
    pub fn has_active_migration(&self, workload_id: &str) -> StateResult<bool> {
        Ok(self
            .list_migrations()?
            .iter()
            .any(|m| m.workload_id == workload_id && !m.status.is_terminal()))
    }

    /// The workload's non-terminal migration, if any.
    pub fn active_migration_for(&self, workload_id: &str) -> StateResult<Option<MigrationRecord>> {
        Ok(self
            .list_migrations()?
            .into_iter()
            .find(|m| m.workload_id == workload_id && !m.status.is_terminal()))
    }

    /// Insert `record` only if its workload has no other non-terminal migration.
    ///
    /// Check and insert happen in one write transaction. Returns `false`
    /// (and writes nothing) when another migration is still active.
    pub fn insert_migration_if_idle(&self, record: &MigrationRecord) -> StateResult<bool> {
        let encoded = encode(record)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
            let busy = active_exists(&table, &record.workload_id, &record.id)?;
            if !busy {
                table
                    .insert(record.id.as_str(), encoded.as_slice())
                    .map_err(map_err!(Write))?;
            }
            inserted = !busy;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(migration_id = %record.id, workload_id = %record.workload_id, inserted, "migration insert");
        Ok(inserted)
    }

    /// Atomically move a migration from one of `from` to `to`.
    ///
    /// Moving back to `Scheduled` from `Failed` is refused once the retry
    /// budget is spent, or when another migration for the same workload has
    /// become active in the meantime.
    pub fn transition_migration<F>(
        &self,
        id: &str,
        from: &[MigrationStatus],
        to: MigrationStatus,
        update: F,
    ) -> StateResult<Transition<MigrationRecord>>
    where
        F: FnOnce(&mut MigrationRecord),
    {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
            let current: Option<MigrationRecord> = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let Some(mut record) = current else {
                return Err(StateError::NotFound(format!("migration {id}")));
            };

            let mut allowed = from.contains(&record.status) && record.status.can_transition_to(to);
            if allowed && record.status.is_terminal() && !to.is_terminal() {
                allowed = record.can_retry()
                    && !active_exists(&table, &record.workload_id, &record.id)?;
            }

            if allowed {
                record.status = to;
                record.updated_at = now;
                update(&mut record);
                let encoded = encode(&record)?;
                table
                    .insert(id, encoded.as_slice())
                    .map_err(map_err!(Write))?;
                outcome = Transition::Applied(record);
            } else {
                outcome = Transition::Rejected(record);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if outcome.is_applied() {
            debug!(migration_id = %id, status = %to, "migration transitioned");
        }
        Ok(outcome)
    }

    /// Read-modify-write a migration without a status guard.
    pub fn update_migration<F>(&self, id: &str, update: F) -> StateResult<MigrationRecord>
    where
        F: FnOnce(&mut MigrationRecord),
    {
        let now = epoch_secs();
        self.modify_json(MIGRATIONS, id, |m: &mut MigrationRecord| {
            update(m);
            m.updated_at = now;
            true
        })?
        .map(|(_, m)| m)
        .ok_or_else(|| StateError::NotFound(format!("migration {id}")))
    }

    // ── Routes ─────────────────────────────────────────────────────

    pub fn put_route(&self, route: &RouteEntry) -> StateResult<()> {
        self.put_json(ROUTES, &route.name, route)
    }

    pub fn get_route(&self, name: &str) -> StateResult<Option<RouteEntry>> {
        self.get_json(ROUTES, name)
    }

    pub fn list_routes(&self) -> StateResult<Vec<RouteEntry>> {
        self.list_json(ROUTES)
    }

    pub fn delete_route(&self, name: &str) -> StateResult<bool> {
        self.delete_key(ROUTES, name)
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let encoded = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, encoded.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "record stored");
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "record deleted");
        Ok(existed)
    }

    /// Load, mutate and (if `apply` returns true) write back one record,
    /// all inside a single write transaction.
    ///
    /// Returns `None` if the key does not exist.
    fn modify_json<T, F>(&self, table: JsonTable, key: &str, apply: F) -> StateResult<Option<(bool, T)>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            outcome = match current {
                Some(mut record) => {
                    let applied = apply(&mut record);
                    if applied {
                        let encoded = encode(&record)?;
                        table
                            .insert(key, encoded.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Some((applied, record))
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }
}

/// Whether any migration other than `except_id` is non-terminal for `workload_id`.
fn active_exists<T>(table: &T, workload_id: &str, except_id: &str) -> StateResult<bool>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value() == except_id {
            continue;
        }
        let existing: MigrationRecord = decode(value.value())?;
        if existing.workload_id == workload_id && !existing.status.is_terminal() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
