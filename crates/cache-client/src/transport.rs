//! Transport seam.
//!
//! The store's wire protocol is an external collaborator. Everything above
//! this module talks to the store through these traits:
//!
//! - [`Connector`] opens transports and sentinel links for one endpoint
//! - [`Transport`] is an established, multiplexed handle safe for concurrent use
//! - [`SentinelLink`] answers master-discovery queries
//! - [`SubscriberLink`] carries SUBSCRIBE/UNSUBSCRIBE; inbound messages arrive
//!   on the sink handed to [`Transport::open_subscriber`]
//!
//! The production implementation lives in [`crate::redis`].

use crate::config::{Endpoint, ProtocolHint};
use crate::errors::ClientError;
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Parameters for opening one connection to one endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub endpoint: Endpoint,
    pub password: Option<SecretString>,
    pub keep_alive: Duration,
    pub allow_admin: bool,
    /// Sent as the connection's client name.
    pub client_name: String,
    pub default_database: u8,
    pub connect_timeout: Duration,
    pub sync_timeout: Duration,
    pub protocol: ProtocolHint,
}

impl ConnectionParams {
    /// Copy of these parameters targeting another endpoint.
    #[must_use]
    pub fn for_endpoint(&self, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..self.clone()
        }
    }
}

/// A message delivered by the store on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: String,
}

/// Sink the transport pushes inbound pub/sub messages into.
pub type MessageSink = mpsc::UnboundedSender<InboundMessage>;

/// Opens transports for single endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a data transport to `params.endpoint`.
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Transport>, ClientError>;

    /// Open a link to the sentinel at `params.endpoint`.
    async fn open_sentinel(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn SentinelLink>, ClientError>;
}

/// Master discovery through a sentinel node.
#[async_trait]
pub trait SentinelLink: Send + Sync {
    /// Current master address for `master_name`, `None` if the sentinel does
    /// not monitor that name.
    async fn master_address(&self, master_name: &str) -> Result<Option<Endpoint>, ClientError>;

    async fn close(&self);
}

/// Subscription control for one subscriber connection.
#[async_trait]
pub trait SubscriberLink: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), ClientError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), ClientError>;

    /// Whether the underlying subscriber connection is still delivering.
    fn is_alive(&self) -> bool;

    async fn close(&self);
}

/// An established handle to one logical store endpoint.
///
/// Every method is one atomic store command. `db` selects the logical
/// database the command runs against.
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET
    async fn get(&self, db: u8, key: &str) -> Result<Option<String>, ClientError>;

    /// SET with optional PX. Returns whether the value was stored.
    async fn set(
        &self,
        db: u8,
        key: &str,
        value: String,
        ttl_ms: Option<u64>,
    ) -> Result<bool, ClientError>;

    /// DEL. Returns whether a key was removed.
    async fn delete(&self, db: u8, key: &str) -> Result<bool, ClientError>;

    /// EXISTS
    async fn exists(&self, db: u8, key: &str) -> Result<bool, ClientError>;

    /// PEXPIRE, or PERSIST when `ttl_ms` is `None`. Returns whether the key's
    /// TTL changed.
    async fn expire(&self, db: u8, key: &str, ttl_ms: Option<u64>) -> Result<bool, ClientError>;

    /// SET NX PX. Returns whether the value was stored.
    async fn set_if_absent(
        &self,
        db: u8,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, ClientError>;

    /// Delete `key` only if it currently holds `expected`, atomically.
    async fn delete_if_equals(&self, db: u8, key: &str, expected: &str)
        -> Result<bool, ClientError>;

    /// Set the TTL of `key` only if it currently holds `expected`, atomically.
    async fn expire_if_equals(
        &self,
        db: u8,
        key: &str,
        expected: &str,
        ttl_ms: u64,
    ) -> Result<bool, ClientError>;

    /// FLUSHDB (admin command).
    async fn flush(&self, db: u8) -> Result<(), ClientError>;

    /// PUBLISH. Returns the receiver count reported by the store.
    async fn publish(&self, channel: &str, payload: &str) -> Result<i64, ClientError>;

    /// Open a dedicated subscriber connection delivering into `sink`.
    async fn open_subscriber(&self, sink: MessageSink)
        -> Result<Arc<dyn SubscriberLink>, ClientError>;

    /// Endpoint this transport is connected to.
    fn endpoint(&self) -> &Endpoint;

    /// Close the transport. Later calls fail with `ClientError::Closed`.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_endpoint_keeps_other_fields() {
        let params = ConnectionParams {
            endpoint: Endpoint::new("a", 1),
            password: None,
            keep_alive: Duration::from_secs(180),
            allow_admin: true,
            client_name: "orders".to_string(),
            default_database: 2,
            connect_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(5),
            protocol: ProtocolHint::Resp3,
        };

        let moved = params.for_endpoint(Endpoint::new("b", 2));
        assert_eq!(moved.endpoint, Endpoint::new("b", 2));
        assert_eq!(moved.client_name, "orders");
        assert_eq!(moved.default_database, 2);
        assert!(moved.allow_admin);
        assert_eq!(moved.protocol, ProtocolHint::Resp3);
    }
}
