//! Per-channel delivery worker and the inbound message router.
//!
//! ```text
//! SubscriberLink --sink--> router --mailbox(1024)--> channel worker --> callbacks
//! ```
//!
//! The router never blocks on a channel: a full mailbox drops the message.
//! A slow callback therefore only delays its own channel.
//!
//! A panicking callback is contained: the panic is logged and counted, and
//! the worker carries on with the remaining subscribers and later messages.

use crate::observability::record_pubsub_message;
use crate::transport::InboundMessage;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Mailbox capacity per channel.
pub const CHANNEL_MAILBOX_CAPACITY: usize = 1024;

/// Delivery callback: `(channel, message)`.
pub type Callback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// One registered callback.
#[derive(Clone)]
pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) callback: Callback,
    pub(crate) active: Arc<AtomicBool>,
}

/// Running worker for one channel.
pub(crate) struct ChannelWorker {
    pub(crate) mailbox: mpsc::Sender<String>,
    pub(crate) subscribers: watch::Sender<Arc<Vec<Subscriber>>>,
    pub(crate) cancel_token: CancellationToken,
}

impl ChannelWorker {
    /// Spawn a worker for `channel` with `first` as its only subscriber.
    pub(crate) fn spawn(channel: String, first: Subscriber, cancel_token: CancellationToken) -> Self {
        let (mailbox, receiver) = mpsc::channel(CHANNEL_MAILBOX_CAPACITY);
        let (subscribers, subscribers_rx) = watch::channel(Arc::new(vec![first]));

        tokio::spawn(run_channel_worker(
            channel,
            receiver,
            subscribers_rx,
            cancel_token.clone(),
        ));

        Self {
            mailbox,
            subscribers,
            cancel_token,
        }
    }

    pub(crate) fn add(&self, subscriber: Subscriber) {
        self.subscribers
            .send_modify(|list| Arc::make_mut(list).push(subscriber));
    }

    /// Whether the worker task is still receiving.
    pub(crate) fn is_running(&self) -> bool {
        !self.mailbox.is_closed()
    }

    /// Stop the worker and deactivate its subscriptions.
    ///
    /// A message already being delivered reaches every subscriber; queued
    /// messages are dropped.
    pub(crate) fn stop(&self) {
        self.cancel_token.cancel();
        for subscriber in self.subscribers.borrow().iter() {
            subscriber.active.store(false, Ordering::Release);
        }
    }
}

async fn run_channel_worker(
    channel: String,
    mut mailbox: mpsc::Receiver<String>,
    subscribers: watch::Receiver<Arc<Vec<Subscriber>>>,
    cancel_token: CancellationToken,
) {
    debug!(target: "cache.pubsub", channel = %channel, "Channel worker started");

    loop {
        tokio::select! {
            biased;

            () = cancel_token.cancelled() => break,

            payload = mailbox.recv() => {
                let Some(payload) = payload else { break };

                let current = Arc::clone(&subscribers.borrow());
                for subscriber in current.iter() {
                    deliver(&channel, &payload, subscriber);
                }
            }
        }
    }

    debug!(target: "cache.pubsub", channel = %channel, "Channel worker stopped");
}

fn deliver(channel: &str, payload: &str, subscriber: &Subscriber) {
    let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(channel, payload)));
    match outcome {
        Ok(()) => record_pubsub_message("delivered"),
        Err(panic) => {
            record_pubsub_message("panicked");
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(
                target: "cache.pubsub",
                channel = %channel,
                subscription = subscriber.id,
                reason = %reason,
                "Subscriber callback panicked"
            );
        }
    }
}

/// Channel name to mailbox routes shared by the dispatcher and the router.
pub(crate) type Routes = Arc<RwLock<HashMap<String, ChannelWorker>>>;

/// Forward inbound messages to channel mailboxes until cancelled.
pub(crate) async fn run_router(
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    routes: Routes,
    cancel_token: CancellationToken,
) {
    debug!(target: "cache.pubsub", "Router started");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            message = inbound.recv() => {
                let Some(message) = message else { break };
                route(&routes, message).await;
            }
        }
    }

    debug!(target: "cache.pubsub", "Router stopped");
}

async fn route(routes: &Routes, message: InboundMessage) {
    let routes = routes.read().await;
    let Some(worker) = routes.get(&message.channel) else {
        record_pubsub_message("unrouted");
        debug!(
            target: "cache.pubsub",
            channel = %message.channel,
            "Message for unregistered channel ignored"
        );
        return;
    };

    match worker.mailbox.try_send(message.payload) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            record_pubsub_message("dropped");
            warn!(
                target: "cache.pubsub",
                channel = %message.channel,
                capacity = CHANNEL_MAILBOX_CAPACITY,
                "Channel mailbox full, message dropped"
            );
        }
        Err(TrySendError::Closed(_)) => {
            record_pubsub_message("dropped");
            debug!(
                target: "cache.pubsub",
                channel = %message.channel,
                "Channel worker gone, message dropped"
            );
        }
    }
}
