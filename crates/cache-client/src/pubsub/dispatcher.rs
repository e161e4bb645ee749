//! Pub/sub dispatcher for one instance.
//!
//! Owns the channel registry, the subscriber link and the delivery tasks.
//! Subscription changes are serialized through one control lock; delivery
//! never takes it.

use crate::database::validate_key;
use crate::errors::ClientError;
use crate::observability::{record_pubsub_message, timed};
use crate::pubsub::worker::{run_router, Callback, ChannelWorker, Routes, Subscriber};
use crate::registry::ConnectionLease;
use crate::transport::{InboundMessage, MessageSink, SubscriberLink, Transport};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle to a live subscriber link.
pub struct PublisherHandle {
    transport: Arc<dyn Transport>,
    link: Arc<dyn SubscriberLink>,
}

impl PublisherHandle {
    /// Publish through the instance transport.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, ClientError> {
        self.transport.publish(channel, payload).await
    }

    /// Whether the subscriber connection is still delivering.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.link.is_alive()
    }
}

impl fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("endpoint", self.transport.endpoint())
            .field("alive", &self.link.is_alive())
            .finish()
    }
}

/// A registered delivery callback.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    channel: String,
    active: Arc<AtomicBool>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// False once the channel was unsubscribed or the dispatcher closed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct Control {
    link: Option<Arc<PublisherHandle>>,
    /// Taken when the router is spawned.
    inbound: Option<mpsc::UnboundedReceiver<InboundMessage>>,
}

/// Per-instance pub/sub dispatcher.
pub struct Dispatcher {
    lease: Arc<ConnectionLease>,
    control: Mutex<Control>,
    routes: Routes,
    sink: MessageSink,
    next_id: AtomicU64,
    closed: AtomicBool,
    cancel_token: CancellationToken,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("instance", &self.lease.instance_name())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(lease: Arc<ConnectionLease>) -> Self {
        let (sink, inbound) = mpsc::unbounded_channel();
        Self {
            lease,
            control: Mutex::new(Control {
                link: None,
                inbound: Some(inbound),
            }),
            routes: Arc::new(RwLock::new(HashMap::new())),
            sink,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.lease.ensure_open()
    }

    /// Return the subscriber link, opening it on first use.
    ///
    /// A link whose connection has died is replaced and every registered
    /// channel is subscribed again on the new link.
    pub async fn publisher(&self) -> Result<Arc<PublisherHandle>, ClientError> {
        self.ensure_open()?;
        let mut control = self.control.lock().await;
        self.ensure_link(&mut control).await
    }

    async fn ensure_link(&self, control: &mut Control) -> Result<Arc<PublisherHandle>, ClientError> {
        if let Some(link) = &control.link {
            if link.is_alive() {
                return Ok(Arc::clone(link));
            }
            warn!(
                target: "cache.pubsub",
                instance = %self.lease.instance_name(),
                "Subscriber link lost, reconnecting"
            );
            link.link.close().await;
            control.link = None;
        }

        if let Some(inbound) = control.inbound.take() {
            tokio::spawn(run_router(
                inbound,
                Arc::clone(&self.routes),
                self.cancel_token.child_token(),
            ));
        }

        let transport = Arc::clone(self.lease.transport());
        let link = transport.open_subscriber(self.sink.clone()).await?;
        let handle = Arc::new(PublisherHandle { transport, link });

        let channels: Vec<String> = self.routes.read().await.keys().cloned().collect();
        for channel in &channels {
            if let Err(e) = handle.link.subscribe(channel).await {
                warn!(
                    target: "cache.pubsub",
                    instance = %self.lease.instance_name(),
                    channel = %channel,
                    error = %e,
                    "Failed to restore subscription on new link"
                );
            }
        }

        debug!(
            target: "cache.pubsub",
            instance = %self.lease.instance_name(),
            restored = channels.len(),
            "Subscriber link opened"
        );

        control.link = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Publish `payload` on `channel`.
    ///
    /// Returns the receiver count reported by the store.
    #[instrument(skip_all, fields(channel = %channel))]
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, ClientError> {
        self.publish_encoded(channel, || Ok(payload.to_string())).await
    }

    /// Publish the payload produced by `encode`.
    ///
    /// `encode` runs only after the handle and channel have been checked.
    pub async fn publish_with<F>(&self, channel: &str, encode: F) -> Result<i64, ClientError>
    where
        F: FnOnce() -> String,
    {
        self.publish_encoded(channel, move || Ok(encode())).await
    }

    /// Publish `value` serialized as JSON.
    pub async fn publish_json<T>(&self, channel: &str, value: &T) -> Result<i64, ClientError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_encoded(channel, || {
            serde_json::to_string(value).map_err(ClientError::from)
        })
        .await
    }

    async fn publish_encoded<F>(&self, channel: &str, encode: F) -> Result<i64, ClientError>
    where
        F: FnOnce() -> Result<String, ClientError>,
    {
        self.ensure_open()?;
        validate_key(channel, "channel")?;

        let payload = encode()?;
        let receivers = timed(
            "publish",
            self.lease.transport().publish(channel, &payload),
        )
        .await?;
        record_pubsub_message("published");
        Ok(receivers)
    }

    /// Register `callback` for messages on `channel`.
    ///
    /// Returns once the store has acknowledged the subscription; delivery
    /// runs on dispatcher tasks. Several callbacks on one channel all receive
    /// every message, over a single store subscription.
    #[instrument(skip_all, fields(channel = %channel))]
    pub async fn subscribe<F>(&self, channel: &str, callback: F) -> Result<Subscription, ClientError>
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        validate_key(channel, "channel")?;

        let callback: Callback = Arc::new(callback);
        let subscriber = Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            callback,
            active: Arc::new(AtomicBool::new(true)),
        };
        let subscription = Subscription {
            id: subscriber.id,
            channel: channel.to_string(),
            active: Arc::clone(&subscriber.active),
        };

        let mut control = self.control.lock().await;
        let handle = self.ensure_link(&mut control).await?;

        {
            let routes = self.routes.read().await;
            if let Some(worker) = routes.get(channel).filter(|w| w.is_running()) {
                worker.add(subscriber);
                debug!(
                    target: "cache.pubsub",
                    subscription = subscription.id,
                    "Callback added to existing channel"
                );
                return Ok(subscription);
            }
        }

        // Route first so nothing delivered right after SUBSCRIBE is lost
        let worker = ChannelWorker::spawn(
            channel.to_string(),
            subscriber,
            self.cancel_token.child_token(),
        );
        if let Some(stale) = self.routes.write().await.insert(channel.to_string(), worker) {
            warn!(
                target: "cache.pubsub",
                instance = %self.lease.instance_name(),
                "Replaced stopped channel worker"
            );
            stale.stop();
        }

        if let Err(e) = handle.link.subscribe(channel).await {
            if let Some(worker) = self.routes.write().await.remove(channel) {
                worker.stop();
            }
            warn!(
                target: "cache.pubsub",
                instance = %self.lease.instance_name(),
                error = %e,
                "Subscribe failed"
            );
            return Err(e);
        }

        info!(
            target: "cache.pubsub",
            instance = %self.lease.instance_name(),
            subscription = subscription.id,
            "Subscribed"
        );
        Ok(subscription)
    }

    /// Remove every callback registered on `channel`.
    ///
    /// Returns whether the channel was registered. Callbacks already running
    /// finish; queued messages are dropped.
    #[instrument(skip_all, fields(channel = %channel))]
    pub async fn unsubscribe(&self, channel: &str) -> Result<bool, ClientError> {
        self.ensure_open()?;
        validate_key(channel, "channel")?;

        let control = self.control.lock().await;
        let Some(worker) = self.routes.write().await.remove(channel) else {
            return Ok(false);
        };
        worker.stop();

        if let Some(handle) = &control.link {
            if handle.is_alive() {
                handle.link.unsubscribe(channel).await?;
            }
        }

        info!(
            target: "cache.pubsub",
            instance = %self.lease.instance_name(),
            "Unsubscribed"
        );
        Ok(true)
    }

    /// Remove every registration made through this dispatcher.
    ///
    /// Local state is always cleared; the first store error is returned.
    pub async fn unsubscribe_all(&self) -> Result<(), ClientError> {
        self.ensure_open()?;

        let control = self.control.lock().await;
        let workers: Vec<(String, ChannelWorker)> = self.routes.write().await.drain().collect();

        let mut first_error = None;
        for (channel, worker) in &workers {
            worker.stop();
            if let Some(handle) = &control.link {
                if handle.is_alive() {
                    if let Err(e) = handle.link.unsubscribe(channel).await {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        }

        info!(
            target: "cache.pubsub",
            instance = %self.lease.instance_name(),
            channels = workers.len(),
            "Unsubscribed from all channels"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Channels with at least one registered callback.
    pub async fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.routes.read().await.keys().cloned().collect();
        channels.sort_unstable();
        channels
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop all delivery tasks and close the subscriber link. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut control = self.control.lock().await;
        for (_, worker) in self.routes.write().await.drain() {
            worker.stop();
        }
        if let Some(handle) = control.link.take() {
            handle.link.close().await;
        }
        self.cancel_token.cancel();

        debug!(
            target: "cache.pubsub",
            instance = %self.lease.instance_name(),
            "Dispatcher closed"
        );
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
