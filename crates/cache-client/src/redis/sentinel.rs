//! Sentinel master discovery.
//!
//! Sentinel nodes only answer the SENTINEL command family; data commands are
//! never sent over this link.

use crate::config::Endpoint;
use crate::errors::ClientError;
use crate::redis::client::connection_info;
use crate::transport::{ConnectionParams, SentinelLink};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Link to one sentinel node.
pub struct RedisSentinelLink {
    endpoint: Endpoint,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisSentinelLink {
    /// Connect to the sentinel at `params.endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connection` if the sentinel is unreachable.
    pub async fn connect(params: &ConnectionParams) -> Result<Self, ClientError> {
        // Sentinels have no logical databases
        let client = Client::open(connection_info(params, 0)).map_err(|e| {
            ClientError::Connection(format!("Failed to open sentinel client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection_with_timeouts(
                params.sync_timeout,
                params.connect_timeout,
            )
            .await
            .map_err(|e| {
                warn!(
                    target: "cache.redis.sentinel",
                    error = %e,
                    endpoint = %params.endpoint,
                    "Failed to connect to sentinel"
                );
                ClientError::Connection(format!(
                    "Failed to connect to sentinel {}: {e}",
                    params.endpoint
                ))
            })?;

        debug!(
            target: "cache.redis.sentinel",
            endpoint = %params.endpoint,
            "Connected to sentinel"
        );

        Ok(Self {
            endpoint: params.endpoint.clone(),
            connection: Mutex::new(Some(connection)),
        })
    }
}

#[async_trait]
impl SentinelLink for RedisSentinelLink {
    #[instrument(skip_all, fields(sentinel = %self.endpoint, master_name = %master_name))]
    async fn master_address(&self, master_name: &str) -> Result<Option<Endpoint>, ClientError> {
        let mut conn = {
            let guard = self.connection.lock().await;
            guard.clone().ok_or(ClientError::Closed)?
        };

        let reply: Option<(String, u16)> = redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(master_name)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "cache.redis.sentinel",
                    error = %e,
                    sentinel = %self.endpoint,
                    "Master discovery query failed"
                );
                ClientError::from(e)
            })?;

        Ok(reply.map(|(host, port)| Endpoint::new(host, port)))
    }

    async fn close(&self) {
        let mut guard = self.connection.lock().await;
        if guard.take().is_some() {
            debug!(
                target: "cache.redis.sentinel",
                sentinel = %self.endpoint,
                "Sentinel link closed"
            );
        }
    }
}
