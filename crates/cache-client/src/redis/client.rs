//! Redis transport implementation.
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is designed to be cloned cheaply and used
//! concurrently. One multiplexed connection is opened per logical database on
//! first use (single-flight), and each command clones it.
//!
//! # Keep-alive
//!
//! Every per-database connection gets a heartbeat task that PINGs it each
//! `keep_alive` interval until the transport is closed.
//!
//! # Usage
//!
//! ```rust,ignore
//! let transport = RedisTransport::connect(&params).await?;
//! transport.set(0, "greeting", "hello".to_string(), Some(60_000)).await?;
//! let value = transport.get(0, "greeting").await?;
//! ```

use crate::config::{Endpoint, ProtocolHint};
use crate::errors::ClientError;
use crate::redis::lua_scripts;
use crate::redis::pubsub::RedisSubscriberLink;
use crate::redis::sentinel::RedisSentinelLink;
use crate::single_flight::SingleFlight;
use crate::transport::{
    ConnectionParams, Connector, MessageSink, SentinelLink, SubscriberLink, Transport,
};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{
    Client, Cmd, ConnectionAddr, ConnectionInfo, FromRedisValue, ProtocolVersion,
    RedisConnectionInfo, Script, Value,
};
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Build redis-rs connection info for one endpoint and database.
pub(crate) fn connection_info(params: &ConnectionParams, db: u8) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(params.endpoint.host.clone(), params.endpoint.port),
        redis: RedisConnectionInfo {
            db: i64::from(db),
            password: params
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string()),
            protocol: match params.protocol {
                ProtocolHint::Resp2 => ProtocolVersion::RESP2,
                ProtocolHint::Resp3 => ProtocolVersion::RESP3,
            },
            ..RedisConnectionInfo::default()
        },
    }
}

/// Client names may not contain spaces.
fn sanitize_client_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect()
}

/// Open one multiplexed connection and tag it with the client name.
async fn open_connection(
    params: &ConnectionParams,
    db: u8,
) -> Result<MultiplexedConnection, ClientError> {
    // Note: Do NOT log connection info as it carries the password
    let client = Client::open(connection_info(params, db)).map_err(|e| {
        error!(
            target: "cache.redis.client",
            error = %e,
            endpoint = %params.endpoint,
            "Failed to open Redis client"
        );
        ClientError::Connection(format!("Failed to open Redis client: {e}"))
    })?;

    let mut connection = client
        .get_multiplexed_async_connection_with_timeouts(
            params.sync_timeout,
            params.connect_timeout,
        )
        .await
        .map_err(|e| {
            warn!(
                target: "cache.redis.client",
                error = %e,
                endpoint = %params.endpoint,
                db = db,
                "Failed to connect to Redis"
            );
            ClientError::Connection(format!(
                "Failed to connect to {}: {e}",
                params.endpoint
            ))
        })?;

    let set_name: Result<Value, _> = redis::cmd("CLIENT")
        .arg("SETNAME")
        .arg(sanitize_client_name(&params.client_name))
        .query_async(&mut connection)
        .await;
    if let Err(e) = set_name {
        // Some proxies reject CLIENT; the connection is still usable
        debug!(
            target: "cache.redis.client",
            error = %e,
            endpoint = %params.endpoint,
            "CLIENT SETNAME rejected"
        );
    }

    Ok(connection)
}

/// Redis-backed [`Transport`].
///
/// Cheap to share behind `Arc`; every command clones a multiplexed connection.
pub struct RedisTransport {
    params: ConnectionParams,
    /// Multiplexed connection per logical database, opened on first use.
    connections: SingleFlight<u8, MultiplexedConnection>,
    /// Precompiled Lua scripts.
    release_script: Script,
    extend_script: Script,
    /// Stops the keep-alive task and subscriber drivers.
    cancel_token: CancellationToken,
    closed: AtomicBool,
}

impl RedisTransport {
    /// Connect to `params.endpoint`.
    ///
    /// Opens the default database connection eagerly so connection failures
    /// surface here, then starts the keep-alive heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connection` if the endpoint is unreachable.
    pub async fn connect(params: &ConnectionParams) -> Result<Arc<Self>, ClientError> {
        let transport = Arc::new(Self::unconnected(params));

        transport.connection(params.default_database).await?;

        info!(
            target: "cache.redis.client",
            endpoint = %params.endpoint,
            client_name = %params.client_name,
            db = params.default_database,
            "Connected to Redis"
        );

        Ok(transport)
    }

    fn unconnected(params: &ConnectionParams) -> Self {
        Self {
            params: params.clone(),
            connections: SingleFlight::new(),
            release_script: Script::new(lua_scripts::COMPARE_AND_DELETE),
            extend_script: Script::new(lua_scripts::COMPARE_AND_PEXPIRE),
            cancel_token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Connection for `db`, opened on first use with its own keep-alive.
    async fn connection(&self, db: u8) -> Result<MultiplexedConnection, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let connection = self
            .connections
            .get_or_try_init(&db, || async move {
                let connection = open_connection(&self.params, db).await?;
                spawn_keep_alive(
                    connection.clone(),
                    self.params.keep_alive,
                    self.params.endpoint.clone(),
                    db,
                    self.cancel_token.child_token(),
                );
                Ok::<_, ClientError>(connection)
            })
            .await?;

        // close() may have drained the map while this connection was opening
        if self.closed.load(Ordering::SeqCst) {
            self.connections.remove(&db).await;
            return Err(ClientError::Closed);
        }
        Ok(connection)
    }

    async fn query<T: FromRedisValue>(
        &self,
        db: u8,
        cmd: &Cmd,
        operation: &'static str,
    ) -> Result<T, ClientError> {
        // Clone the connection (cheap operation) for this request
        let mut conn = self.connection(db).await?;
        cmd.query_async(&mut conn).await.map_err(|e| {
            warn!(
                target: "cache.redis.client",
                error = %e,
                operation = operation,
                db = db,
                "Redis command failed"
            );
            ClientError::from(e)
        })
    }

    async fn invoke(
        &self,
        db: u8,
        script: &Script,
        key: &str,
        args: &[&str],
        operation: &'static str,
    ) -> Result<i64, ClientError> {
        let mut conn = self.connection(db).await?;
        let mut invocation = script.key(key);
        for arg in args {
            invocation.arg(*arg);
        }
        invocation.invoke_async(&mut conn).await.map_err(|e| {
            warn!(
                target: "cache.redis.client",
                error = %e,
                operation = operation,
                db = db,
                "Redis script failed"
            );
            ClientError::from(e)
        })
    }
}

fn spawn_keep_alive(
    connection: MultiplexedConnection,
    interval: Duration,
    endpoint: Endpoint,
    db: u8,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!(
                        target: "cache.redis.client",
                        endpoint = %endpoint,
                        db = db,
                        "Keep-alive stopped"
                    );
                    break;
                }
                _ = ticker.tick() => {
                    let mut conn = connection.clone();
                    let pong: Result<Value, _> = redis::cmd("PING").query_async(&mut conn).await;
                    if let Err(e) = pong {
                        warn!(
                            target: "cache.redis.client",
                            error = %e,
                            endpoint = %endpoint,
                            db = db,
                            "Keep-alive PING failed"
                        );
                    }
                }
            }
        }
    });
}

#[async_trait]
impl Transport for RedisTransport {
    #[instrument(skip_all, fields(db = db))]
    async fn get(&self, db: u8, key: &str) -> Result<Option<String>, ClientError> {
        self.query(db, redis::cmd("GET").arg(key), "get").await
    }

    #[instrument(skip_all, fields(db = db))]
    async fn set(
        &self,
        db: u8,
        key: &str,
        value: String,
        ttl_ms: Option<u64>,
    ) -> Result<bool, ClientError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ms) = ttl_ms {
            cmd.arg("PX").arg(ms);
        }
        let reply: Value = self.query(db, &cmd, "set").await?;
        Ok(!matches!(reply, Value::Nil))
    }

    #[instrument(skip_all, fields(db = db))]
    async fn delete(&self, db: u8, key: &str) -> Result<bool, ClientError> {
        let removed: i64 = self.query(db, redis::cmd("DEL").arg(key), "delete").await?;
        Ok(removed > 0)
    }

    #[instrument(skip_all, fields(db = db))]
    async fn exists(&self, db: u8, key: &str) -> Result<bool, ClientError> {
        let count: i64 = self.query(db, redis::cmd("EXISTS").arg(key), "exists").await?;
        Ok(count > 0)
    }

    #[instrument(skip_all, fields(db = db))]
    async fn expire(&self, db: u8, key: &str, ttl_ms: Option<u64>) -> Result<bool, ClientError> {
        let changed: i64 = match ttl_ms {
            Some(ms) => {
                self.query(db, redis::cmd("PEXPIRE").arg(key).arg(ms), "expire")
                    .await?
            }
            None => self.query(db, redis::cmd("PERSIST").arg(key), "persist").await?,
        };
        Ok(changed == 1)
    }

    #[instrument(skip_all, fields(db = db))]
    async fn set_if_absent(
        &self,
        db: u8,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, ClientError> {
        let reply: Value = self
            .query(
                db,
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms),
                "set_if_absent",
            )
            .await?;
        Ok(!matches!(reply, Value::Nil))
    }

    #[instrument(skip_all, fields(db = db))]
    async fn delete_if_equals(
        &self,
        db: u8,
        key: &str,
        expected: &str,
    ) -> Result<bool, ClientError> {
        let result = self
            .invoke(db, &self.release_script, key, &[expected], "delete_if_equals")
            .await?;
        Ok(result == 1)
    }

    #[instrument(skip_all, fields(db = db))]
    async fn expire_if_equals(
        &self,
        db: u8,
        key: &str,
        expected: &str,
        ttl_ms: u64,
    ) -> Result<bool, ClientError> {
        let ttl = ttl_ms.to_string();
        let result = self
            .invoke(
                db,
                &self.extend_script,
                key,
                &[expected, ttl.as_str()],
                "expire_if_equals",
            )
            .await?;
        Ok(result == 1)
    }

    #[instrument(skip_all, fields(db = db))]
    async fn flush(&self, db: u8) -> Result<(), ClientError> {
        let _: Value = self.query(db, &redis::cmd("FLUSHDB"), "flush").await?;
        Ok(())
    }

    #[instrument(skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, payload: &str) -> Result<i64, ClientError> {
        self.query(
            self.params.default_database,
            redis::cmd("PUBLISH").arg(channel).arg(payload),
            "publish",
        )
        .await
    }

    async fn open_subscriber(
        &self,
        sink: MessageSink,
    ) -> Result<Arc<dyn SubscriberLink>, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let link =
            RedisSubscriberLink::open(&self.params, sink, self.cancel_token.child_token()).await?;
        Ok(Arc::new(link))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.params.endpoint
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_token.cancel();
        // Dropping the multiplexed connections closes their sockets
        let dropped = self.connections.drain().await.len();
        info!(
            target: "cache.redis.client",
            endpoint = %self.params.endpoint,
            connections = dropped,
            "Redis transport closed"
        );
    }
}

/// Production [`Connector`] backed by redis-rs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Transport>, ClientError> {
        let transport = RedisTransport::connect(params).await?;
        Ok(transport)
    }

    async fn open_sentinel(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn SentinelLink>, ClientError> {
        let link = RedisSentinelLink::connect(params).await?;
        Ok(Arc::new(link))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn params() -> ConnectionParams {
        ConnectionParams {
            endpoint: Endpoint::new("cache.internal", 6380),
            password: Some(SecretString::from("pw")),
            keep_alive: Duration::from_secs(180),
            allow_admin: false,
            client_name: "orders service".to_string(),
            default_database: 0,
            connect_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(5),
            protocol: ProtocolHint::Resp3,
        }
    }

    #[test]
    fn test_connection_info_mapping() {
        let info = connection_info(&params(), 4);

        assert!(matches!(
            &info.addr,
            ConnectionAddr::Tcp(host, 6380) if host == "cache.internal"
        ));
        assert_eq!(info.redis.db, 4);
        assert_eq!(info.redis.password.as_deref(), Some("pw"));
        assert!(matches!(info.redis.protocol, ProtocolVersion::RESP3));
    }

    #[test]
    fn test_connection_info_without_password() {
        let mut params = params();
        params.password = None;
        params.protocol = ProtocolHint::Resp2;

        let info = connection_info(&params, 0);
        assert!(info.redis.password.is_none());
        assert!(matches!(info.redis.protocol, ProtocolVersion::RESP2));
    }

    #[test]
    fn test_client_name_is_sanitized() {
        assert_eq!(sanitize_client_name("orders service"), "orders-service");
        assert_eq!(sanitize_client_name("orders"), "orders");
    }

    #[test]
    fn test_connection_info_is_accepted_by_client() {
        assert!(Client::open(connection_info(&params(), 0)).is_ok());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_endpoint_fails() {
        let mut params = params();
        // Port 1 on localhost is reserved and refuses connections
        params.endpoint = Endpoint::new("127.0.0.1", 1);
        params.connect_timeout = Duration::from_millis(200);

        let result = RedisTransport::connect(&params).await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }

    #[tokio::test]
    async fn test_closed_transport_opens_no_connections() {
        let mut params = params();
        params.endpoint = Endpoint::new("127.0.0.1", 1);
        let transport = RedisTransport::unconnected(&params);

        transport.close().await;
        transport.close().await;

        assert!(matches!(transport.get(0, "k").await, Err(ClientError::Closed)));
        assert!(matches!(transport.get(5, "k").await, Err(ClientError::Closed)));
        assert!(matches!(
            transport.open_subscriber(tokio::sync::mpsc::unbounded_channel().0).await,
            Err(ClientError::Closed)
        ));
        assert_eq!(transport.connections.len().await, 0);
        assert!(transport.cancel_token.is_cancelled());
    }
}
