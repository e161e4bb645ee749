//! Redis subscriber connection.
//!
//! A redis-rs `aio::PubSub` connection needs `&mut` access both to change
//! subscriptions and to read messages, so it is owned by a driver task.
//! `RedisSubscriberLink` talks to the driver over an mpsc mailbox; inbound
//! messages are forwarded into the dispatcher's sink.
//!
//! # Lifecycle
//!
//! 1. `open` connects and spawns the driver
//! 2. The driver runs until cancelled, the mailbox closes, the sink closes, or
//!    the server connection ends
//! 3. `is_alive` turns false once the driver exits

use crate::errors::ClientError;
use crate::redis::client::connection_info;
use crate::transport::{ConnectionParams, InboundMessage, MessageSink, SubscriberLink};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::PubSub;
use redis::{Client, Msg};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mailbox size for subscription commands.
const COMMAND_CHANNEL_BUFFER: usize = 64;

enum PubSubCommand {
    Subscribe {
        channel: String,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Unsubscribe {
        channel: String,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
}

/// Handle to a subscriber connection driver.
pub struct RedisSubscriberLink {
    commands: mpsc::Sender<PubSubCommand>,
    cancel_token: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl RedisSubscriberLink {
    /// Open a subscriber connection and spawn its driver.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connection` if the connection cannot be opened
    /// within the connect timeout.
    pub async fn open(
        params: &ConnectionParams,
        sink: MessageSink,
        cancel_token: CancellationToken,
    ) -> Result<Self, ClientError> {
        let client = Client::open(connection_info(params, params.default_database))
            .map_err(|e| ClientError::Connection(format!("Failed to open Redis client: {e}")))?;

        let pubsub = tokio::time::timeout(params.connect_timeout, client.get_async_pubsub())
            .await
            .map_err(|_| {
                ClientError::Connection(format!(
                    "Timed out opening subscriber connection to {}",
                    params.endpoint
                ))
            })?
            .map_err(|e| {
                warn!(
                    target: "cache.redis.pubsub",
                    error = %e,
                    endpoint = %params.endpoint,
                    "Failed to open subscriber connection"
                );
                ClientError::Connection(format!(
                    "Failed to open subscriber connection to {}: {e}",
                    params.endpoint
                ))
            })?;

        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let alive = Arc::new(AtomicBool::new(true));

        let driver = PubSubDriver {
            pubsub,
            commands: receiver,
            sink,
            cancel_token: cancel_token.clone(),
            alive: Arc::clone(&alive),
            channels: HashSet::new(),
            endpoint: params.endpoint.to_string(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            commands,
            cancel_token,
            alive,
        })
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), ClientError>>) -> PubSubCommand,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ClientError::Connection("subscriber connection closed".to_string()))?;

        rx.await
            .map_err(|_| ClientError::Connection("subscriber connection closed".to_string()))?
    }
}

#[async_trait]
impl SubscriberLink for RedisSubscriberLink {
    async fn subscribe(&self, channel: &str) -> Result<(), ClientError> {
        let channel = channel.to_string();
        self.request(|respond_to| PubSubCommand::Subscribe {
            channel,
            respond_to,
        })
        .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), ClientError> {
        let channel = channel.to_string();
        self.request(|respond_to| PubSubCommand::Unsubscribe {
            channel,
            respond_to,
        })
        .await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.commands.is_closed()
    }

    async fn close(&self) {
        self.cancel_token.cancel();
    }
}

struct PubSubDriver {
    pubsub: PubSub,
    commands: mpsc::Receiver<PubSubCommand>,
    sink: MessageSink,
    cancel_token: CancellationToken,
    alive: Arc<AtomicBool>,
    /// Channels currently subscribed on this connection.
    channels: HashSet<String>,
    endpoint: String,
}

async fn next_message(pubsub: &mut PubSub) -> Option<Msg> {
    pubsub.on_message().next().await
}

impl PubSubDriver {
    async fn run(mut self) {
        debug!(
            target: "cache.redis.pubsub",
            endpoint = %self.endpoint,
            "Subscriber driver started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "cache.redis.pubsub",
                        endpoint = %self.endpoint,
                        "Subscriber driver received cancellation signal"
                    );
                    break;
                }

                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }

                message = next_message(&mut self.pubsub) => {
                    match message {
                        Some(message) => {
                            if !self.forward(&message) {
                                break;
                            }
                        }
                        None => {
                            warn!(
                                target: "cache.redis.pubsub",
                                endpoint = %self.endpoint,
                                channels = self.channels.len(),
                                "Subscriber connection ended"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.alive.store(false, Ordering::Release);
        info!(
            target: "cache.redis.pubsub",
            endpoint = %self.endpoint,
            "Subscriber driver stopped"
        );
    }

    async fn handle_command(&mut self, command: PubSubCommand) {
        match command {
            PubSubCommand::Subscribe {
                channel,
                respond_to,
            } => {
                let result = self
                    .pubsub
                    .subscribe(&channel)
                    .await
                    .map_err(ClientError::from);
                if result.is_ok() {
                    self.channels.insert(channel);
                }
                let _ = respond_to.send(result);
            }

            PubSubCommand::Unsubscribe {
                channel,
                respond_to,
            } => {
                let result = if self.channels.remove(&channel) {
                    self.pubsub
                        .unsubscribe(&channel)
                        .await
                        .map_err(ClientError::from)
                } else {
                    Ok(())
                };
                let _ = respond_to.send(result);
            }
        }
    }

    /// Forward one message to the sink. Returns false once the sink is gone.
    fn forward(&self, message: &Msg) -> bool {
        let channel = message.get_channel_name().to_string();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    target: "cache.redis.pubsub",
                    error = %e,
                    channel = %channel,
                    "Dropping message with non-string payload"
                );
                return true;
            }
        };

        self.sink
            .send(InboundMessage { channel, payload })
            .is_ok()
    }
}
