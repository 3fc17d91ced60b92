//! Redis `SUBSCRIBE`/`PUBLISH` as a [`PubSubTransport`].
//!
//! A subscribed connection cannot run other commands, so the subscriber
//! connection is owned by a background task that takes subscribe requests
//! over a command channel and forwards messages to the notifier. Publishing
//! goes through the shared connection.
//!
//! If the subscriber connection drops, the task reconnects, resubscribes to
//! every channel and wakes them all, since messages sent in between are lost.

use evlog_core::notifier::{IncomingSender, NotifierError, PubSubTransport, TransportMessage};
use futures::StreamExt;
use futures::future::BoxFuture;
use redis::AsyncCommands;
use redis::Client;
use redis::aio::{ConnectionManager, PubSub};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type Reply = oneshot::Sender<Result<(), String>>;

enum Command {
    Subscribe(String, Reply),
    Unsubscribe(String, Reply),
}

enum Event {
    Command(Option<Command>),
    Message(Option<redis::Msg>),
}

/// Redis pub/sub transport.
pub struct RedisPubSub {
    publisher: ConnectionManager,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl RedisPubSub {
    /// Open a subscriber connection and start forwarding messages to `incoming`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::TransportError`] if the subscriber connection
    /// cannot be opened.
    pub async fn connect(
        client: Client,
        publisher: ConnectionManager,
        incoming: IncomingSender,
    ) -> Result<Self, NotifierError> {
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| NotifierError::TransportError(format!("Failed to open subscriber: {e}")))?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_subscriber(client, pubsub, receiver, incoming));
        Ok(Self {
            publisher,
            commands,
            task,
        })
    }

    async fn request(&self, channel: &str, command: fn(String, Reply) -> Command) -> Result<(), String> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(channel.to_string(), reply))
            .map_err(|_| "subscriber task stopped".to_string())?;
        response
            .await
            .map_err(|_| "subscriber task stopped".to_string())?
    }
}

impl PubSubTransport for RedisPubSub {
    fn subscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), NotifierError>> {
        Box::pin(async move {
            self.request(channel, Command::Subscribe)
                .await
                .map_err(|reason| NotifierError::SubscribeFailed {
                    channel: channel.to_string(),
                    reason,
                })
        })
    }

    fn unsubscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), NotifierError>> {
        Box::pin(async move {
            self.request(channel, Command::Unsubscribe)
                .await
                .map_err(|reason| NotifierError::UnsubscribeFailed {
                    channel: channel.to_string(),
                    reason,
                })
        })
    }

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<(), NotifierError>> {
        Box::pin(async move {
            let mut conn = self.publisher.clone();
            let _receivers: i64 = conn.publish(channel, payload).await.map_err(|e| {
                NotifierError::PublishFailed {
                    channel: channel.to_string(),
                    reason: e.to_string(),
                }
            })?;
            Ok(())
        })
    }
}

impl Drop for RedisPubSub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_subscriber(
    client: Client,
    mut pubsub: PubSub,
    mut commands: mpsc::UnboundedReceiver<Command>,
    incoming: IncomingSender,
) {
    let mut channels: HashSet<String> = HashSet::new();

    loop {
        let event = {
            let mut messages = pubsub.on_message();
            tokio::select! {
                command = commands.recv() => Event::Command(command),
                message = messages.next() => Event::Message(message),
            }
        };

        match event {
            Event::Command(None) => break,
            Event::Command(Some(Command::Subscribe(channel, reply))) => {
                let result = pubsub.subscribe(&channel).await.map_err(|e| e.to_string());
                if result.is_ok() {
                    channels.insert(channel);
                }
                let _ = reply.send(result);
            }
            Event::Command(Some(Command::Unsubscribe(channel, reply))) => {
                let result = pubsub.unsubscribe(&channel).await.map_err(|e| e.to_string());
                channels.remove(&channel);
                let _ = reply.send(result);
            }
            Event::Message(Some(message)) => {
                let payload: String = message.get_payload().unwrap_or_default();
                let forwarded = incoming.send(TransportMessage {
                    channel: message.get_channel_name().to_string(),
                    payload,
                });
                if forwarded.is_err() {
                    break;
                }
            }
            Event::Message(None) => {
                tracing::warn!(channels = channels.len(), "Redis subscriber connection lost");
                pubsub = reconnect(&client, &channels).await;
                for channel in &channels {
                    let _ = incoming.send(TransportMessage {
                        channel: channel.clone(),
                        payload: String::new(),
                    });
                }
            }
        }
    }

    tracing::debug!("Redis subscriber task finished");
}

async fn reconnect(client: &Client, channels: &HashSet<String>) -> PubSub {
    loop {
        tokio::time::sleep(RECONNECT_DELAY).await;
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::error!(error = %e, "Redis subscriber reconnect failed");
                continue;
            }
        };
        let mut restored = true;
        for channel in channels {
            if let Err(e) = pubsub.subscribe(channel).await {
                tracing::error!(channel = %channel, error = %e, "Resubscribe failed");
                restored = false;
                break;
            }
        }
        if restored {
            tracing::info!(channels = channels.len(), "Redis subscriber reconnected");
            return pubsub;
        }
    }
}
