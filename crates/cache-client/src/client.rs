//! Client facade for one named instance.
//!
//! # Lifecycle
//!
//! ```text
//! connect(config) --ok--> Connected --dispose()--> Closed
//!        |
//!        +--err--> (no client)
//! ```
//!
//! Disposal is idempotent and safe to call concurrently. Clients for the same
//! instance name share one connection through a registry lease; the
//! connection is closed exactly once, when the last of them disposes. Every
//! handle derived from a disposed client (databases, lock managers, the
//! dispatcher) fails with `ClientError::Closed` before touching the store.
//!
//! Database selection and the admin flag come from each client's own config,
//! so clients sharing a connection may use different default databases.

use crate::config::InstanceConfig;
use crate::database::Database;
use crate::errors::ClientError;
use crate::lock::LockManager;
use crate::pubsub::Dispatcher;
use crate::registry::{ConnectionLease, ConnectionRegistry};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, instrument};

/// Connected client for one instance.
pub struct Client {
    registry: Arc<ConnectionRegistry>,
    lease: Arc<ConnectionLease>,
    database: Database,
    database_count: u8,
    allow_admin: bool,
    dispatcher: Arc<Dispatcher>,
    disposed: OnceCell<()>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("instance", &self.lease.instance_name())
            .field("db", &self.database.index())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    /// Connect using the process-wide registry.
    ///
    /// # Errors
    ///
    /// - `ClientError::Config` if `config` is invalid (no I/O is attempted)
    /// - `ClientError::Connection` if no endpoint could be reached
    pub async fn connect(config: InstanceConfig) -> Result<Self, ClientError> {
        Self::connect_with(config, ConnectionRegistry::shared()).await
    }

    /// Connect through an explicit registry.
    #[instrument(skip_all, fields(instance = %config.instance_name))]
    pub async fn connect_with(
        config: InstanceConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let lease = registry.acquire(&config).await?;

        let database = Database::new(
            Arc::clone(&lease),
            config.default_database,
            config.allow_admin,
        );
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&lease)));

        info!(
            target: "cache.client",
            instance = %config.instance_name,
            db = database.index(),
            holders = lease.connection().holders(),
            "Client connected"
        );

        Ok(Self {
            registry,
            lease,
            database,
            database_count: config.database_count,
            allow_admin: config.allow_admin,
            dispatcher,
            disposed: OnceCell::new(),
        })
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    #[must_use]
    pub fn instance_name(&self) -> &str {
        self.lease.instance_name()
    }

    /// Handle to the configured default database.
    pub fn database(&self) -> Result<Database, ClientError> {
        self.ensure_open()?;
        Ok(self.database.clone())
    }

    /// Handle to database `index`.
    ///
    /// # Errors
    ///
    /// `ClientError::DatabaseOutOfRange` unless `index < database_count`.
    pub fn database_at(&self, index: u8) -> Result<Database, ClientError> {
        self.ensure_open()?;
        let count = self.database_count;
        if index >= count {
            return Err(ClientError::DatabaseOutOfRange { index, count });
        }
        Ok(Database::new(Arc::clone(&self.lease), index, self.allow_admin))
    }

    /// Pub/sub dispatcher for this client.
    pub fn pubsub(&self) -> Result<Arc<Dispatcher>, ClientError> {
        self.ensure_open()?;
        Ok(Arc::clone(&self.dispatcher))
    }

    /// Lock manager on the default database.
    pub fn locks(&self) -> Result<LockManager, ClientError> {
        self.ensure_open()?;
        Ok(self.database.locks())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.disposed.initialized() || self.lease.is_closed()
    }

    /// Close the dispatcher and release this client's lease.
    ///
    /// The instance connection closes when no other client holds it.
    /// Concurrent callers wait for the one in-progress disposal.
    pub async fn dispose(&self) {
        self.disposed
            .get_or_init(|| async {
                self.dispatcher.close().await;
                self.registry.release(&self.lease).await;

                info!(
                    target: "cache.client",
                    instance = %self.lease.instance_name(),
                    "Client disposed"
                );
            })
            .await;
    }
}
