//! Pre-configured test data fixtures for cache-client testing.

use crate::mock_store::{MockConnector, MockStore};
use cache_client::config::{Endpoint, InstanceConfig};
use cache_client::registry::ConnectionRegistry;
use std::sync::Arc;

/// Endpoint on the default store port.
#[must_use]
pub fn endpoint(host: &str) -> Endpoint {
    Endpoint::new(host, 6379)
}

/// Valid direct-mode config with one endpoint per host, in order.
#[must_use]
pub fn test_config(instance_name: &str, hosts: &[&str]) -> InstanceConfig {
    InstanceConfig::new(instance_name, hosts.iter().map(|host| endpoint(host)).collect())
}

/// A mock connector over a fresh store, and a registry using it.
pub struct TestHarness {
    pub store: MockStore,
    pub connector: Arc<MockConnector>,
    pub registry: Arc<ConnectionRegistry>,
}

impl TestHarness {
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(|connector| connector)
    }

    /// Harness whose connector is customized by `configure`.
    #[must_use]
    pub fn with_connector(configure: impl FnOnce(MockConnector) -> MockConnector) -> Self {
        let store = MockStore::new();
        let connector = Arc::new(configure(MockConnector::new(store.clone())));
        let registry = Arc::new(ConnectionRegistry::with_connector(
            Arc::clone(&connector) as Arc<dyn cache_client::transport::Connector>
        ));
        Self {
            store,
            connector,
            registry,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
