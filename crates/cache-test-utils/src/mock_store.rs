//! In-memory store mock for cache-client testing.
//!
//! Provides an in-memory implementation of the transport seam:
//! - Key-value state per logical database, with TTLs on tokio time (so
//!   `tokio::time::pause` / `advance` drive expiry)
//! - Lock primitives (SET NX, compare-and-delete, compare-and-expire)
//! - Pub/sub fan-out to subscriber links, with a per-channel SUBSCRIBE count
//! - A command log for asserting that no I/O happened
//!
//! # Example
//!
//! ```rust,ignore
//! use cache_test_utils::{MockConnector, MockStore};
//!
//! let store = MockStore::new();
//! let connector = Arc::new(MockConnector::new(store.clone()));
//! let registry = Arc::new(ConnectionRegistry::with_connector(connector.clone()));
//!
//! let client = Client::connect_with(config, registry).await?;
//! client.database()?.set("k", "v", Expiry::Persist).await?;
//! assert_eq!(store.value(0, "k").as_deref(), Some("v"));
//! ```

use async_trait::async_trait;
use cache_client::config::Endpoint;
use cache_client::errors::ClientError;
use cache_client::transport::{
    ConnectionParams, Connector, InboundMessage, MessageSink, SentinelLink, SubscriberLink,
    Transport,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct LinkState {
    sink: MessageSink,
    channels: HashSet<String>,
    alive: bool,
}

#[derive(Debug, Default)]
struct MockStoreInner {
    databases: HashMap<u8, HashMap<String, Entry>>,
    links: HashMap<u64, LinkState>,
    next_link_id: u64,
    subscribe_calls: HashMap<String, usize>,
    commands: Vec<String>,
    unavailable: bool,
}

impl MockStoreInner {
    fn record(&mut self, command: &str) -> Result<(), ClientError> {
        self.commands.push(command.to_string());
        if self.unavailable {
            return Err(ClientError::Connection("mock store unavailable".to_string()));
        }
        Ok(())
    }

    /// Live entry for `key`, purging it if expired.
    fn live(&mut self, db: u8, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        let database = self.databases.entry(db).or_default();
        if database.get(key).is_some_and(|entry| entry.is_expired(now)) {
            database.remove(key);
        }
        database.get_mut(key)
    }
}

fn deadline(ttl_ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ttl_ms)
}

/// Shared in-memory store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<MockStoreInner>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a key.
    pub fn with_value(self, db: u8, key: &str, value: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .databases
            .entry(db)
            .or_default()
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
        self
    }

    /// Current value of `key`, honoring TTLs.
    pub fn value(&self, db: u8, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.live(db, key).map(|entry| entry.value.clone())
    }

    /// Remaining TTL of `key`; `None` for absent or persistent keys.
    pub fn ttl(&self, db: u8, key: &str) -> Option<Duration> {
        let mut inner = self.inner.lock().unwrap();
        let expires_at = inner.live(db, key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    /// Make every command fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn command_count(&self) -> usize {
        self.inner.lock().unwrap().commands.len()
    }

    /// Number of SUBSCRIBE commands received for `channel`.
    pub fn subscribe_calls(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .subscribe_calls
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// Number of live subscriber links currently subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .links
            .values()
            .filter(|link| link.alive && link.channels.contains(channel))
            .count()
    }

    /// Number of subscriber links ever opened.
    pub fn links_opened(&self) -> u64 {
        self.inner.lock().unwrap().next_link_id
    }

    /// Drop every subscriber link, as if the server closed the connections.
    pub fn kill_subscriber_links(&self) {
        let mut inner = self.inner.lock().unwrap();
        for link in inner.links.values_mut() {
            link.alive = false;
            link.channels.clear();
        }
    }

    /// Deliver `payload` to every link subscribed to `channel`.
    ///
    /// Returns the number of receiving links.
    pub fn publish(&self, channel: &str, payload: &str) -> i64 {
        let inner = self.inner.lock().unwrap();
        let mut receivers = 0;
        for link in inner.links.values() {
            if link.alive && link.channels.contains(channel) {
                let delivered = link
                    .sink
                    .send(InboundMessage {
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                    })
                    .is_ok();
                if delivered {
                    receivers += 1;
                }
            }
        }
        receivers
    }

    fn open_link(&self, sink: MessageSink) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_link_id;
        inner.next_link_id += 1;
        inner.links.insert(
            id,
            LinkState {
                sink,
                channels: HashSet::new(),
                alive: true,
            },
        );
        id
    }
}

/// Mock transport over a [`MockStore`].
#[derive(Debug)]
pub struct MockTransport {
    store: MockStore,
    endpoint: Endpoint,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new(store: MockStore, endpoint: Endpoint) -> Self {
        Self {
            store,
            endpoint,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// How many times `close` was called.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn begin(&self, command: &str) -> Result<std::sync::MutexGuard<'_, MockStoreInner>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let mut inner = self.store.inner.lock().unwrap();
        inner.record(command)?;
        Ok(inner)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, db: u8, key: &str) -> Result<Option<String>, ClientError> {
        let mut inner = self.begin("GET")?;
        Ok(inner.live(db, key).map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        db: u8,
        key: &str,
        value: String,
        ttl_ms: Option<u64>,
    ) -> Result<bool, ClientError> {
        let mut inner = self.begin("SET")?;
        inner.databases.entry(db).or_default().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl_ms.map(deadline),
            },
        );
        Ok(true)
    }

    async fn delete(&self, db: u8, key: &str) -> Result<bool, ClientError> {
        let mut inner = self.begin("DEL")?;
        let existed = inner.live(db, key).is_some();
        inner.databases.entry(db).or_default().remove(key);
        Ok(existed)
    }

    async fn exists(&self, db: u8, key: &str) -> Result<bool, ClientError> {
        let mut inner = self.begin("EXISTS")?;
        Ok(inner.live(db, key).is_some())
    }

    async fn expire(&self, db: u8, key: &str, ttl_ms: Option<u64>) -> Result<bool, ClientError> {
        let command = if ttl_ms.is_some() { "PEXPIRE" } else { "PERSIST" };
        let mut inner = self.begin(command)?;
        let Some(entry) = inner.live(db, key) else {
            return Ok(false);
        };
        match ttl_ms {
            Some(ttl_ms) => {
                entry.expires_at = Some(deadline(ttl_ms));
                Ok(true)
            }
            // PERSIST only reports a change when a TTL was removed
            None => Ok(entry.expires_at.take().is_some()),
        }
    }

    async fn set_if_absent(
        &self,
        db: u8,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, ClientError> {
        let mut inner = self.begin("SET NX")?;
        if inner.live(db, key).is_some() {
            return Ok(false);
        }
        inner.databases.entry(db).or_default().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(deadline(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(
        &self,
        db: u8,
        key: &str,
        expected: &str,
    ) -> Result<bool, ClientError> {
        let mut inner = self.begin("EVAL compare-and-delete")?;
        let matches = inner
            .live(db, key)
            .is_some_and(|entry| entry.value == expected);
        if matches {
            inner.databases.entry(db).or_default().remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equals(
        &self,
        db: u8,
        key: &str,
        expected: &str,
        ttl_ms: u64,
    ) -> Result<bool, ClientError> {
        let mut inner = self.begin("EVAL compare-and-pexpire")?;
        match inner.live(db, key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(deadline(ttl_ms));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn flush(&self, db: u8) -> Result<(), ClientError> {
        let mut inner = self.begin("FLUSHDB")?;
        inner.databases.remove(&db);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<i64, ClientError> {
        drop(self.begin("PUBLISH")?);
        Ok(self.store.publish(channel, payload))
    }

    async fn open_subscriber(
        &self,
        sink: MessageSink,
    ) -> Result<Arc<dyn SubscriberLink>, ClientError> {
        drop(self.begin("SUBSCRIBER CONNECT")?);
        let id = self.store.open_link(sink);
        Ok(Arc::new(MockSubscriberLink {
            store: self.store.clone(),
            id,
        }))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Mock subscriber link registered in a [`MockStore`].
#[derive(Debug)]
pub struct MockSubscriberLink {
    store: MockStore,
    id: u64,
}

impl MockSubscriberLink {
    fn with_link<T>(&self, f: impl FnOnce(&mut LinkState) -> T) -> Result<T, ClientError> {
        let mut inner = self.store.inner.lock().unwrap();
        match inner.links.get_mut(&self.id) {
            Some(link) if link.alive => Ok(f(link)),
            _ => Err(ClientError::Connection(
                "subscriber connection closed".to_string(),
            )),
        }
    }
}

#[async_trait]
impl SubscriberLink for MockSubscriberLink {
    async fn subscribe(&self, channel: &str) -> Result<(), ClientError> {
        self.with_link(|link| {
            link.channels.insert(channel.to_string());
        })?;
        let mut inner = self.store.inner.lock().unwrap();
        *inner.subscribe_calls.entry(channel.to_string()).or_insert(0) += 1;
        inner.commands.push("SUBSCRIBE".to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), ClientError> {
        self.with_link(|link| {
            link.channels.remove(channel);
        })?;
        self.store
            .inner
            .lock()
            .unwrap()
            .commands
            .push("UNSUBSCRIBE".to_string());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.with_link(|_| ()).is_ok()
    }

    async fn close(&self) {
        let mut inner = self.store.inner.lock().unwrap();
        if let Some(link) = inner.links.get_mut(&self.id) {
            link.alive = false;
            link.channels.clear();
        }
    }
}

/// Mock sentinel answering from a fixed master table.
#[derive(Debug)]
pub struct MockSentinel {
    masters: HashMap<String, Endpoint>,
    closed: AtomicBool,
}

impl MockSentinel {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SentinelLink for MockSentinel {
    async fn master_address(&self, master_name: &str) -> Result<Option<Endpoint>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(self.masters.get(master_name).cloned())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Mock connector handing out [`MockTransport`]s over one shared store.
#[derive(Debug, Default)]
pub struct MockConnector {
    store: MockStore,
    failing: HashSet<Endpoint>,
    sentinels: HashMap<Endpoint, HashMap<String, Endpoint>>,
    connect_delay: Option<Duration>,
    attempts: Mutex<Vec<Endpoint>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    opened_sentinels: Mutex<Vec<Arc<MockSentinel>>>,
}

impl MockConnector {
    pub fn new(store: MockStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// Refuse connections to `endpoint`.
    pub fn with_failing_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.failing.insert(endpoint);
        self
    }

    /// Make `sentinel` report `master` for `master_name`.
    pub fn with_sentinel(mut self, sentinel: Endpoint, master_name: &str, master: Endpoint) -> Self {
        self.sentinels
            .entry(sentinel)
            .or_default()
            .insert(master_name.to_string(), master);
        self
    }

    /// Delay every connection attempt.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn store(&self) -> &MockStore {
        &self.store
    }

    /// Every endpoint a connection (data or sentinel) was attempted to, in order.
    pub fn attempts(&self) -> Vec<Endpoint> {
        self.attempts.lock().unwrap().clone()
    }

    /// Number of data transports successfully opened.
    pub fn connect_count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    /// Data transports opened so far.
    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().unwrap().clone()
    }

    /// Sentinel links opened so far.
    pub fn sentinels(&self) -> Vec<Arc<MockSentinel>> {
        self.opened_sentinels.lock().unwrap().clone()
    }

    async fn attempt(&self, endpoint: &Endpoint) -> Result<(), ClientError> {
        self.attempts.lock().unwrap().push(endpoint.clone());
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(endpoint) {
            return Err(ClientError::Connection(format!(
                "connection refused: {endpoint}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Transport>, ClientError> {
        self.attempt(&params.endpoint).await?;
        let transport = Arc::new(MockTransport::new(
            self.store.clone(),
            params.endpoint.clone(),
        ));
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }

    async fn open_sentinel(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn SentinelLink>, ClientError> {
        self.attempt(&params.endpoint).await?;
        let sentinel = Arc::new(MockSentinel {
            masters: self
                .sentinels
                .get(&params.endpoint)
                .cloned()
                .unwrap_or_default(),
            closed: AtomicBool::new(false),
        });
        self.opened_sentinels
            .lock()
            .unwrap()
            .push(Arc::clone(&sentinel));
        Ok(sentinel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_follows_tokio_time() {
        let store = MockStore::new();
        let transport = MockTransport::new(store.clone(), Endpoint::new("mock", 6379));

        transport.set(0, "k", "v".to_string(), Some(1000)).await.unwrap();
        assert_eq!(store.value(0, "k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(store.value(0, "k"), None);
    }

    #[tokio::test]
    async fn test_publish_counts_subscribed_links() {
        let store = MockStore::new();
        let transport = MockTransport::new(store.clone(), Endpoint::new("mock", 6379));
        let (sink, mut inbound) = mpsc::unbounded_channel();

        let link = transport.open_subscriber(sink).await.unwrap();
        link.subscribe("news").await.unwrap();

        assert_eq!(transport.publish("news", "hello").await.unwrap(), 1);
        assert_eq!(transport.publish("other", "ignored").await.unwrap(), 0);
        assert_eq!(inbound.recv().await.unwrap().payload, "hello");

        store.kill_subscriber_links();
        assert!(!link.is_alive());
        assert_eq!(transport.publish("news", "lost").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_commands() {
        let transport = MockTransport::new(MockStore::new(), Endpoint::new("mock", 6379));
        transport.close().await;
        assert!(matches!(
            transport.get(0, "k").await,
            Err(ClientError::Closed)
        ));
        assert_eq!(transport.close_calls(), 1);
    }
}
