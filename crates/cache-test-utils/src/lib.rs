//! # Cache Test Utilities
//!
//! Shared test utilities for the cache client.
//!
//! This crate provides mock implementations of the transport seam for
//! isolated testing without a running store.
//!
//! ## Modules
//!
//! - `mock_store` - In-memory store, transport, subscriber link, sentinel and
//!   connector mocks
//! - `fixtures` - Pre-configured instance configs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cache_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     // Connector whose first endpoint refuses connections
//!     let store = MockStore::new();
//!     let connector = Arc::new(
//!         MockConnector::new(store.clone()).with_failing_endpoint(endpoint("primary")),
//!     );
//!     let registry = Arc::new(ConnectionRegistry::with_connector(connector.clone()));
//!
//!     let client = Client::connect_with(
//!         test_config("orders", &["primary", "replica"]),
//!         registry,
//!     )
//!     .await
//!     .unwrap();
//!
//!     // Run your test...
//! }
//! ```
//!
//! ## Test Patterns
//!
//! ### TTL Tests
//!
//! `MockStore` expires keys on tokio time, so paused-clock tests control
//! expiry exactly:
//!
//! ```rust,ignore
//! #[tokio::test(start_paused = true)]
//! async fn test_expiry() {
//!     db.set("k", "v", 10_u64).await.unwrap();
//!     tokio::time::advance(Duration::from_secs(11)).await;
//!     assert_eq!(db.get("k").await.unwrap(), None);
//! }
//! ```

pub mod fixtures;
pub mod mock_store;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_store::*;
