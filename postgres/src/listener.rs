//! `LISTEN`/`NOTIFY` as a [`PubSubTransport`].
//!
//! A single [`PgListener`] connection is owned by a background task. Listen
//! and unlisten requests are sent to the task over a command channel, and
//! every notification it receives is forwarded to the notifier.
//!
//! When the listener connection drops, sqlx reconnects and re-listens on its
//! own, but notifications sent in between are lost. The task therefore
//! injects one wake per listened channel after a reconnect, so live queries
//! re-read and catch up.
//!
//! `PostgreSQL` channel names are identifiers of at most 63 bytes, while a
//! stream key may be longer. Keys that fit are used as they are; longer keys
//! are replaced by a digest (see [`channel_name`]) on both the publish and
//! the listen side, and notifications are mapped back to the key before they
//! reach the notifier.

use evlog_core::notifier::{IncomingSender, NotifierError, PubSubTransport, TransportMessage};
use futures::future::BoxFuture;
use sqlx::PgPool;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgListener;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Longest channel name `PostgreSQL` accepts (`NAMEDATALEN - 1`).
pub const MAX_CHANNEL_BYTES: usize = 63;

/// The `PostgreSQL` channel carrying wakes for `key`.
///
/// Keys of at most [`MAX_CHANNEL_BYTES`] bytes map to themselves. Longer keys
/// map to `evlog:` followed by the first 24 bytes of their SHA-256 digest in
/// hex, which stays within the limit.
#[must_use]
pub fn channel_name(key: &str) -> String {
    if key.len() <= MAX_CHANNEL_BYTES {
        return key.to_string();
    }
    let digest = Sha256::digest(key.as_bytes());
    format!("evlog:{}", hex::encode(&digest[..24]))
}

enum Command {
    Listen(String, oneshot::Sender<Result<(), String>>),
    Unlisten(String, oneshot::Sender<Result<(), String>>),
}

/// PostgreSQL notification transport.
pub struct PgNotifyTransport {
    pool: PgPool,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl PgNotifyTransport {
    /// Open a listener connection from `pool` and start forwarding
    /// notifications to `incoming`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::TransportError`] if the listener connection
    /// cannot be opened.
    pub async fn connect(pool: PgPool, incoming: IncomingSender) -> Result<Self, NotifierError> {
        let listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| NotifierError::TransportError(format!("Failed to open listener: {e}")))?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_listener(listener, receiver, incoming));
        Ok(Self {
            pool,
            commands,
            task,
        })
    }

    async fn request(
        &self,
        channel: &str,
        command: fn(String, oneshot::Sender<Result<(), String>>) -> Command,
    ) -> Result<(), String> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(channel.to_string(), reply))
            .map_err(|_| "listener task stopped".to_string())?;
        response
            .await
            .map_err(|_| "listener task stopped".to_string())?
    }
}

impl PubSubTransport for PgNotifyTransport {
    fn subscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), NotifierError>> {
        Box::pin(async move {
            self.request(channel, Command::Listen)
                .await
                .map_err(|reason| NotifierError::SubscribeFailed {
                    channel: channel.to_string(),
                    reason,
                })
        })
    }

    fn unsubscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), NotifierError>> {
        Box::pin(async move {
            self.request(channel, Command::Unlisten)
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
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(channel_name(channel))
                .bind(payload)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|e| NotifierError::PublishFailed {
                    channel: channel.to_string(),
                    reason: e.to_string(),
                })
        })
    }
}

impl Drop for PgNotifyTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_listener(
    mut listener: PgListener,
    mut commands: mpsc::UnboundedReceiver<Command>,
    incoming: IncomingSender,
) {
    // Listened channel name -> stream key.
    let mut channels: HashMap<String, String> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Listen(key, reply)) => {
                    let name = channel_name(&key);
                    let result = listener.listen(&name).await.map_err(|e| e.to_string());
                    if result.is_ok() {
                        channels.insert(name, key);
                    }
                    let _ = reply.send(result);
                }
                Some(Command::Unlisten(key, reply)) => {
                    let name = channel_name(&key);
                    let result = listener.unlisten(&name).await.map_err(|e| e.to_string());
                    channels.remove(&name);
                    let _ = reply.send(result);
                }
                None => break,
            },
            notification = listener.try_recv() => match notification {
                Ok(Some(notification)) => {
                    let name = notification.channel();
                    let message = TransportMessage {
                        channel: channels.get(name).cloned().unwrap_or_else(|| name.to_string()),
                        payload: notification.payload().to_string(),
                    };
                    if incoming.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::warn!(
                        channels = channels.len(),
                        "Listener connection lost, waking all channels"
                    );
                    for key in channels.values() {
                        let _ = incoming.send(TransportMessage {
                            channel: key.clone(),
                            payload: String::new(),
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Listener receive failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            },
        }
    }

    tracing::debug!("Listener task finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_keys_are_their_own_channel() {
        assert_eq!(channel_name("chat"), "chat");
        let limit = "k".repeat(MAX_CHANNEL_BYTES);
        assert_eq!(channel_name(&limit), limit);
    }

    #[test]
    fn long_keys_map_to_a_bounded_digest() {
        let long = "k".repeat(70);
        let name = channel_name(&long);
        assert!(name.len() <= MAX_CHANNEL_BYTES);
        assert!(name.starts_with("evlog:"));
        assert_eq!(name, channel_name(&long));
        assert_ne!(name, channel_name(&"k".repeat(71)));
    }

    #[test]
    fn multibyte_keys_are_measured_in_bytes() {
        // 32 characters, 64 bytes.
        let key = "é".repeat(32);
        assert!(channel_name(&key).len() <= MAX_CHANNEL_BYTES);
        assert_ne!(channel_name(&key), key);
    }
}
