//! Cache Client Library
//!
//! Client-side access layer for a Redis-compatible key-value store:
//!
//! - Lazily created, single-flight connections per named instance, with
//!   endpoint failover and sentinel master discovery
//! - A key-value façade with TTLs and caller-supplied value codecs
//! - Token-owned TTL locks (SET NX PX plus compare-and-delete scripts)
//! - Publish/subscribe with per-channel delivery workers
//!
//! # Architecture
//!
//! ```text
//! Client (one per instance)
//! ├── Database (per logical db index) ──┐
//! │   └── LockManager                   ├── ConnectionLease ── InstanceConnection ── Transport
//! └── Dispatcher ───────────────────────┘              (ConnectionRegistry, shared per name)
//!     ├── router task
//!     └── worker task per channel
//! ```
//!
//! The store is reached only through the [`transport`] traits. The
//! production implementation in [`redis`] uses redis-rs multiplexed
//! connections; tests substitute an in-memory connector.
//!
//! # Modules
//!
//! - [`client`] - Client facade and lifecycle
//! - [`registry`] - Connection registry and failover
//! - [`database`] - Key-value façade
//! - [`lock`] - Distributed locks
//! - [`pubsub`] - Pub/sub dispatcher
//! - [`config`] - Instance configuration from environment
//! - [`errors`] - Error types
//! - [`observability`] - Metrics

pub mod client;
pub mod config;
pub mod database;
pub mod errors;
pub mod lock;
pub mod observability;
pub mod pubsub;
pub mod redis;
pub mod registry;
pub mod single_flight;
pub mod transport;
pub mod types;

pub use client::Client;
pub use config::{ConfigError, Endpoint, InstanceConfig, ProtocolHint};
pub use database::Database;
pub use errors::ClientError;
pub use lock::{LockManager, LockToken};
pub use pubsub::{Dispatcher, PublisherHandle, Subscription};
pub use registry::{ConnectionLease, ConnectionRegistry, InstanceConnection};
pub use types::{Expiry, Ttl};
