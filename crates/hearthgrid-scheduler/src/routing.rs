//! Client routing registration.
//!
//! When a workload becomes Running its name must resolve to
//! `node_address:port` in the connection proxy; when it stops the entry is
//! removed. [`StoreRoutes`] keeps the table in the state store, where the
//! proxy reads it.

use async_trait::async_trait;
use tracing::debug;

use hearthgrid_state::{NodeInfo, RouteEntry, StateStore, WorkloadRecord, epoch_secs};

/// Publishes workload addresses to the client-facing proxy.
#[async_trait]
pub trait RouteRegistrar: Send + Sync {
    async fn register_server(&self, name: &str, address: &str) -> anyhow::Result<()>;

    async fn unregister_server(&self, name: &str) -> anyhow::Result<()>;
}

/// Address clients use to reach `workload` on `node`.
pub fn workload_address(workload: &WorkloadRecord, node: &NodeInfo) -> String {
    format!("{}:{}", node.address, workload.port)
}

/// Route table persisted in the state store.
#[derive(Clone)]
pub struct StoreRoutes {
    state: StateStore,
}

impl StoreRoutes {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }
}

#[async_trait]
impl RouteRegistrar for StoreRoutes {
    async fn register_server(&self, name: &str, address: &str) -> anyhow::Result<()> {
        self.state.put_route(&RouteEntry {
            name: name.to_string(),
            address: address.to_string(),
            updated_at: epoch_secs(),
        })?;
        debug!(name, address, "route registered");
        Ok(())
    }

    async fn unregister_server(&self, name: &str) -> anyhow::Result<()> {
        if self.state.delete_route(name)? {
            debug!(name, "route removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_unregister() {
        let state = StateStore::open_in_memory().unwrap();
        let routes = StoreRoutes::new(state.clone());

        routes.register_server("survival", "10.0.0.5:25565").await.unwrap();
        assert_eq!(
            state.get_route("survival").unwrap().unwrap().address,
            "10.0.0.5:25565"
        );

        routes.register_server("survival", "10.0.0.9:25565").await.unwrap();
        assert_eq!(
            state.get_route("survival").unwrap().unwrap().address,
            "10.0.0.9:25565"
        );

        routes.unregister_server("survival").await.unwrap();
        assert!(state.get_route("survival").unwrap().is_none());
        // Removing an absent route is not an error.
        routes.unregister_server("survival").await.unwrap();
    }
}
