//! Connection registry.
//!
//! Maps instance names to lazily created [`InstanceConnection`]s. Creation is
//! single-flight per name: concurrent first callers share one connection
//! attempt, and a failed attempt is not cached.
//!
//! # Resolution
//!
//! - Direct mode: endpoints are tried in list order; the first successful
//!   connection wins.
//! - Sentinel mode: each sentinel is asked for the configured master in list
//!   order; the first resolved master is connected. Data commands only ever go
//!   to the master transport.
//!
//! # Leases
//!
//! Clients hold a [`ConnectionLease`] rather than the connection itself.
//! Every lease counts as one holder; the connection is detached and closed
//! when its last holder releases. A connection whose holders all left is
//! retired and never handed out again.

use crate::config::{ConfigError, InstanceConfig};
use crate::errors::ClientError;
use crate::observability::record_connection_attempt;
use crate::redis::RedisConnector;
use crate::single_flight::SingleFlight;
use crate::transport::{ConnectionParams, Connector, SentinelLink, Transport};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, instrument, warn};

/// Live connection state for one named instance.
pub struct InstanceConnection {
    config: InstanceConfig,
    transport: Arc<dyn Transport>,
    /// Kept for the lifetime of the entry in sentinel mode.
    sentinel: Option<Arc<dyn SentinelLink>>,
    /// Live lease count, or `RETIRED` once the last lease was released.
    holders: AtomicUsize,
    closed: AtomicBool,
}

const RETIRED: usize = usize::MAX;

impl InstanceConnection {
    fn new(
        config: InstanceConfig,
        transport: Arc<dyn Transport>,
        sentinel: Option<Arc<dyn SentinelLink>>,
    ) -> Self {
        Self {
            config,
            transport,
            sentinel,
            holders: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of leases currently held on this connection.
    #[must_use]
    pub fn holders(&self) -> usize {
        match self.holders.load(Ordering::Acquire) {
            RETIRED => 0,
            count => count,
        }
    }

    /// Register one more holder. Fails once the connection is retired or closed.
    fn retain(&self) -> bool {
        let mut current = self.holders.load(Ordering::Acquire);
        loop {
            if current == RETIRED || self.is_closed() {
                return false;
            }
            match self.holders.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one holder. Returns true when it was the last one; the
    /// connection is then retired.
    fn release_holder(&self) -> bool {
        let mut current = self.holders.load(Ordering::Acquire);
        loop {
            if current == RETIRED || current == 0 {
                return false;
            }
            let next = if current == 1 { RETIRED } else { current - 1 };
            match self.holders.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next == RETIRED,
                Err(actual) => current = actual,
            }
        }
    }

    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.config.instance_name
    }

    #[must_use]
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Transport to the data node (the resolved master in sentinel mode).
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[must_use]
    pub fn has_sentinel(&self) -> bool {
        self.sentinel.is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail with `ClientError::Closed` once this connection has been closed.
    pub(crate) fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Close the transport and the sentinel link. Only the first call acts.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.transport.close().await;
        if let Some(sentinel) = &self.sentinel {
            sentinel.close().await;
        }

        info!(
            target: "cache.registry",
            instance = %self.config.instance_name,
            endpoint = %self.transport.endpoint(),
            "Instance connection closed"
        );
    }
}

impl fmt::Debug for InstanceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConnection")
            .field("instance_name", &self.config.instance_name)
            .field("endpoint", self.transport.endpoint())
            .field("sentinel", &self.sentinel.is_some())
            .field("holders", &self.holders())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One holder's claim on a shared [`InstanceConnection`].
///
/// Handles derived from a lease fail with `ClientError::Closed` once the
/// lease is released, even while other leases keep the connection open.
pub struct ConnectionLease {
    connection: Arc<InstanceConnection>,
    released: AtomicBool,
}

impl ConnectionLease {
    #[must_use]
    pub fn connection(&self) -> &Arc<InstanceConnection> {
        &self.connection
    }

    #[must_use]
    pub fn instance_name(&self) -> &str {
        self.connection.instance_name()
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.connection.transport()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.connection.is_closed()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("instance_name", &self.connection.instance_name())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

/// Registry of instance connections keyed by instance name.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    entries: SingleFlight<String, Arc<InstanceConnection>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Registry backed by the Redis connector.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(RedisConnector))
    }

    /// Registry backed by a custom connector.
    #[must_use]
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            entries: SingleFlight::new(),
        }
    }

    /// Process-wide registry used by `Client::connect`.
    pub fn shared() -> Arc<ConnectionRegistry> {
        static SHARED: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(ConnectionRegistry::new())))
    }

    /// Return the connection for `instance_name`, creating it on first use.
    ///
    /// `config_factory` runs only when no connection exists yet. Its result
    /// is validated before any connection attempt.
    ///
    /// # Errors
    ///
    /// - `ClientError::Config` if the config is invalid or names another instance
    /// - `ClientError::Connection` if no endpoint (or sentinel) yields a connection
    #[instrument(skip_all, fields(instance = %instance_name))]
    pub async fn get_or_create<F>(
        &self,
        instance_name: &str,
        config_factory: F,
    ) -> Result<Arc<InstanceConnection>, ClientError>
    where
        F: FnOnce() -> InstanceConfig,
    {
        self.entries
            .get_or_try_init(&instance_name.to_string(), || async move {
                let config = config_factory();
                self.create(instance_name, config).await.map(Arc::new)
            })
            .await
    }

    /// Return the connection for `instance_name` without creating one.
    pub async fn get(&self, instance_name: &str) -> Option<Arc<InstanceConnection>> {
        self.entries.get(&instance_name.to_string()).await
    }

    /// Detach and close the connection for `instance_name`.
    ///
    /// Returns whether a connection was registered.
    pub async fn remove(&self, instance_name: &str) -> bool {
        match self.entries.remove(&instance_name.to_string()).await {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Take a lease on the connection named by `config`, creating the
    /// connection on first use.
    ///
    /// `config` only shapes a newly created connection; an existing one is
    /// shared as is. A connection retired by a concurrent last release is
    /// detached and replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// As [`ConnectionRegistry::get_or_create`].
    pub async fn acquire(
        &self,
        config: &InstanceConfig,
    ) -> Result<Arc<ConnectionLease>, ClientError> {
        loop {
            let connection = self
                .get_or_create(&config.instance_name, || config.clone())
                .await?;

            if connection.retain() {
                debug!(
                    target: "cache.registry",
                    instance = %config.instance_name,
                    holders = connection.holders(),
                    "Connection lease acquired"
                );
                return Ok(Arc::new(ConnectionLease {
                    connection,
                    released: AtomicBool::new(false),
                }));
            }

            self.detach(&connection).await;
        }
    }

    /// Release `lease`. The last release of a connection detaches and
    /// closes it. Releasing the same lease twice is a no-op.
    pub async fn release(&self, lease: &ConnectionLease) {
        if lease.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let connection = &lease.connection;
        if connection.release_holder() {
            self.detach(connection).await;
            connection.close().await;
        } else {
            debug!(
                target: "cache.registry",
                instance = %connection.instance_name(),
                holders = connection.holders(),
                "Connection lease released, connection still held"
            );
        }
    }

    /// Remove `connection` from the map if it is still the registered entry.
    async fn detach(&self, connection: &Arc<InstanceConnection>) {
        self.entries
            .remove_if(&connection.instance_name().to_string(), |entry| {
                Arc::ptr_eq(entry, connection)
            })
            .await;
    }

    /// Detach and close every registered connection.
    pub async fn close_all(&self) {
        let drained = self.entries.drain().await;
        let count = drained.len();
        for (_, connection) in drained {
            connection.close().await;
        }
        debug!(target: "cache.registry", count = count, "Closed all instance connections");
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.entries.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.is_empty().await
    }

    async fn create(
        &self,
        instance_name: &str,
        config: InstanceConfig,
    ) -> Result<InstanceConnection, ClientError> {
        config.validate()?;
        if config.instance_name != instance_name {
            return Err(ConfigError::InvalidValue(format!(
                "config names instance '{}' but '{}' was requested",
                config.instance_name, instance_name
            ))
            .into());
        }

        let first = config
            .endpoints
            .first()
            .cloned()
            .ok_or_else(|| ConfigError::Missing("endpoint list".to_string()))?;
        let params = ConnectionParams {
            endpoint: first,
            password: config.password.clone(),
            keep_alive: config.keep_alive,
            allow_admin: config.allow_admin,
            client_name: config.instance_name.clone(),
            default_database: config.default_database,
            connect_timeout: config.connect_timeout,
            sync_timeout: config.sync_timeout,
            protocol: config.protocol,
        };

        let (transport, sentinel) = match config.sentinel_master() {
            Some(master_name) => {
                let (transport, sentinel) =
                    self.connect_via_sentinel(&config, &params, master_name).await?;
                (transport, Some(sentinel))
            }
            None => (self.connect_direct(&config, &params).await?, None),
        };

        info!(
            target: "cache.registry",
            instance = %config.instance_name,
            endpoint = %transport.endpoint(),
            sentinel = sentinel.is_some(),
            "Instance connection established"
        );

        Ok(InstanceConnection::new(config, transport, sentinel))
    }

    async fn connect_direct(
        &self,
        config: &InstanceConfig,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn Transport>, ClientError> {
        let mut last_error = None;

        for endpoint in &config.endpoints {
            match self.connector.connect(&params.for_endpoint(endpoint.clone())).await {
                Ok(transport) => {
                    record_connection_attempt("success");
                    return Ok(transport);
                }
                Err(e) => {
                    record_connection_attempt("error");
                    warn!(
                        target: "cache.registry",
                        instance = %config.instance_name,
                        endpoint = %endpoint,
                        error = %e,
                        "Endpoint connection failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(ClientError::Connection(format!(
            "Failed to connect to instance '{}' after trying {} endpoint(s){}",
            config.instance_name,
            config.endpoints.len(),
            last_error.map(|e| format!(": {e}")).unwrap_or_default()
        )))
    }

    async fn connect_via_sentinel(
        &self,
        config: &InstanceConfig,
        params: &ConnectionParams,
        master_name: &str,
    ) -> Result<(Arc<dyn Transport>, Arc<dyn SentinelLink>), ClientError> {
        for endpoint in &config.endpoints {
            let sentinel = match self
                .connector
                .open_sentinel(&params.for_endpoint(endpoint.clone()))
                .await
            {
                Ok(sentinel) => sentinel,
                Err(e) => {
                    record_connection_attempt("error");
                    warn!(
                        target: "cache.registry",
                        instance = %config.instance_name,
                        sentinel = %endpoint,
                        error = %e,
                        "Sentinel connection failed, trying next"
                    );
                    continue;
                }
            };

            let master = match sentinel.master_address(master_name).await {
                Ok(Some(master)) => master,
                Ok(None) => {
                    warn!(
                        target: "cache.registry",
                        instance = %config.instance_name,
                        sentinel = %endpoint,
                        master_name = %master_name,
                        "Sentinel does not know the master"
                    );
                    sentinel.close().await;
                    continue;
                }
                Err(e) => {
                    warn!(
                        target: "cache.registry",
                        instance = %config.instance_name,
                        sentinel = %endpoint,
                        error = %e,
                        "Master lookup failed"
                    );
                    sentinel.close().await;
                    continue;
                }
            };

            debug!(
                target: "cache.registry",
                instance = %config.instance_name,
                master = %master,
                "Resolved master through sentinel"
            );

            match self.connector.connect(&params.for_endpoint(master.clone())).await {
                Ok(transport) => {
                    record_connection_attempt("success");
                    return Ok((transport, sentinel));
                }
                Err(e) => {
                    record_connection_attempt("error");
                    warn!(
                        target: "cache.registry",
                        instance = %config.instance_name,
                        master = %master,
                        error = %e,
                        "Master connection failed"
                    );
                    sentinel.close().await;
                }
            }
        }

        Err(ClientError::Connection(format!(
            "Master '{}' could not be resolved and connected through any of {} sentinel(s)",
            master_name,
            config.endpoints.len()
        )))
    }
}
