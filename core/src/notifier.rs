//! Reference-counted channel subscriptions over a pub/sub transport.
//!
//! Many readers of the same stream share one transport-level subscription.
//! The [`Notifier`] keeps a reference count per channel: the first local
//! subscriber triggers the transport `subscribe`, the last one to leave
//! triggers the transport `unsubscribe`. Concurrent first subscribers wait on
//! the same pending subscribe, so the transport never sees a duplicate.
//!
//! ```text
//!   transport ──(channel, payload)──► dispatcher ──► broadcast per channel
//!                                                        │
//!                                         ┌──────────────┼──────────────┐
//!                                         ▼              ▼              ▼
//!                                  ChannelSubscription  ...   ChannelSubscription
//! ```
//!
//! Transports only need to implement [`PubSubTransport`] and push every
//! received message into the sender handed to [`Notifier::new`].

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Default per-channel wake buffer.
///
/// Overflow is harmless: a lagging subscriber still observes one wake.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Errors raised by the notifier and its transports.
///
/// `Clone` so one failed transport subscribe can be reported to every
/// subscriber that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifierError {
    /// Transport-level subscribe failed.
    #[error("Subscribe failed for channel '{channel}': {reason}")]
    SubscribeFailed {
        /// The channel.
        channel: String,
        /// The reason for failure.
        reason: String,
    },

    /// Transport-level unsubscribe failed.
    #[error("Unsubscribe failed for channel '{channel}': {reason}")]
    UnsubscribeFailed {
        /// The channel.
        channel: String,
        /// The reason for failure.
        reason: String,
    },

    /// Publishing a wake signal failed.
    #[error("Publish failed for channel '{channel}': {reason}")]
    PublishFailed {
        /// The channel.
        channel: String,
        /// The reason for failure.
        reason: String,
    },

    /// Connection-level failure.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The transport has shut down.
    #[error("Notifier closed")]
    Closed,
}

/// A message received from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Payload (often empty; only the arrival matters).
    pub payload: String,
}

/// Sender transports push received messages into.
pub type IncomingSender = mpsc::UnboundedSender<TransportMessage>;

/// Receiver handed to [`Notifier::new`].
pub type IncomingReceiver = mpsc::UnboundedReceiver<TransportMessage>;

/// Create the incoming message channel for a transport.
#[must_use]
pub fn incoming_channel() -> (IncomingSender, IncomingReceiver) {
    mpsc::unbounded_channel()
}

/// Backend pub/sub primitive.
///
/// Implementations deliver every message received on a subscribed channel to
/// the [`IncomingSender`] they were built with. Delivery order per channel
/// must be preserved; duplicates are harmless.
///
/// Returns boxed futures so the notifier can hold `Arc<dyn PubSubTransport>`.
pub trait PubSubTransport: Send + Sync + 'static {
    /// Start receiving messages on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::SubscribeFailed`] if the backend rejects it.
    fn subscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), NotifierError>>;

    /// Stop receiving messages on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::UnsubscribeFailed`] if the backend rejects it.
    fn unsubscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), NotifierError>>;

    /// Publish `payload` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::PublishFailed`] if the backend rejects it.
    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<(), NotifierError>>;
}

/// A wake-up delivered to channel subscribers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WakeSignal {
    /// Payload as published (empty for plain wakes).
    pub payload: String,
}

type SharedResult = Shared<BoxFuture<'static, Result<(), NotifierError>>>;
type SharedDone = Shared<BoxFuture<'static, ()>>;

struct ChannelState {
    refcount: usize,
    generation: u64,
    sender: broadcast::Sender<WakeSignal>,
    ready: SharedResult,
}

#[derive(Default)]
struct State {
    channels: HashMap<String, ChannelState>,
    closing: HashMap<String, (u64, SharedDone)>,
    next_generation: u64,
    closed: bool,
}

struct Inner {
    transport: Arc<dyn PubSubTransport>,
    state: Mutex<State>,
    capacity: usize,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop one reference. Returns the transport teardown when it was the last.
    fn release(self: &Arc<Self>, channel: &str, generation: u64) -> Option<BoxFuture<'static, ()>> {
        let mut state = self.state();
        let entry = state.channels.get_mut(channel)?;
        if entry.generation != generation {
            return None;
        }
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return None;
        }
        let entry = state.channels.remove(channel)?;

        let transport = Arc::clone(&self.transport);
        let name = channel.to_string();
        let ready = entry.ready;
        let teardown = async move {
            // Nothing to undo if the subscribe itself never succeeded.
            if ready.await.is_err() {
                return;
            }
            match transport.unsubscribe(&name).await {
                Ok(()) => tracing::debug!(channel = %name, "Unsubscribed from channel"),
                Err(e) => tracing::warn!(channel = %name, error = %e, "Channel unsubscribe failed"),
            }
        }
        .boxed()
        .shared();
        state.closing.insert(channel.to_string(), (generation, teardown.clone()));
        drop(state);

        let inner = Arc::downgrade(self);
        let name = channel.to_string();
        Some(
            async move {
                teardown.await;
                if let Some(inner) = inner.upgrade() {
                    let mut state = inner.state();
                    if state.closing.get(&name).is_some_and(|(g, _)| *g == generation) {
                        state.closing.remove(&name);
                    }
                }
            }
            .boxed(),
        )
    }
}

/// Shared, reference-counted subscription manager.
///
/// Cheap to clone; all clones share the same channel table.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl Notifier {
    /// Create a notifier over `transport`.
    ///
    /// `incoming` must be the receiving half of the channel the transport
    /// pushes its messages into. Spawns the dispatch task, so this must be
    /// called from within a Tokio runtime.
    pub fn new(transport: impl PubSubTransport, incoming: IncomingReceiver) -> Self {
        Self::with_capacity(transport, incoming, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Like [`Notifier::new`] with an explicit per-channel wake buffer.
    pub fn with_capacity(
        transport: impl PubSubTransport,
        incoming: IncomingReceiver,
        capacity: usize,
    ) -> Self {
        let inner = Arc::new(Inner {
            transport: Arc::new(transport),
            state: Mutex::new(State::default()),
            capacity: capacity.max(1),
        });
        tokio::spawn(dispatch(Arc::downgrade(&inner), incoming));
        Self { inner }
    }

    /// Subscribe to wake signals on `channel`.
    ///
    /// The first local subscriber issues the transport subscribe; later ones
    /// (including concurrent ones) share it. If the transport subscribe
    /// fails, every subscriber waiting on it gets the error and the next
    /// attempt starts fresh.
    ///
    /// # Errors
    ///
    /// Returns the transport error from the shared subscribe, or
    /// [`NotifierError::Closed`] once the transport has shut down.
    pub async fn subscribe(
        &self,
        channel: impl Into<String>,
    ) -> Result<ChannelSubscription, NotifierError> {
        let channel = channel.into();
        let (mut subscription, ready) = self.join(&channel)?;

        if let Err(e) = ready.await {
            subscription.abandon();
            tracing::warn!(channel = %channel, error = %e, "Channel subscribe failed");
            return Err(e);
        }
        Ok(subscription)
    }

    fn join(&self, channel: &str) -> Result<(ChannelSubscription, SharedResult), NotifierError> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(NotifierError::Closed);
        }

        if let Some(entry) = state.channels.get_mut(channel) {
            entry.refcount += 1;
            let subscription = ChannelSubscription {
                channel: channel.to_string(),
                generation: entry.generation,
                receiver: entry.sender.subscribe(),
                inner: Some(Arc::clone(&self.inner)),
            };
            return Ok((subscription, entry.ready.clone()));
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let pending_close = state.closing.get(channel).map(|(_, done)| done.clone());
        let transport = Arc::clone(&self.inner.transport);
        let name = channel.to_string();
        let ready = async move {
            // A teardown still in flight must land before we resubscribe.
            if let Some(done) = pending_close {
                done.await;
            }
            let result = transport.subscribe(&name).await;
            if result.is_ok() {
                tracing::debug!(channel = %name, "Subscribed to channel");
            }
            result
        }
        .boxed()
        .shared();

        let (sender, receiver) = broadcast::channel(self.inner.capacity);
        state.channels.insert(
            channel.to_string(),
            ChannelState {
                refcount: 1,
                generation,
                sender,
                ready: ready.clone(),
            },
        );

        let subscription = ChannelSubscription {
            channel: channel.to_string(),
            generation,
            receiver,
            inner: Some(Arc::clone(&self.inner)),
        };
        Ok((subscription, ready))
    }

    /// Publish a wake signal on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifierError::PublishFailed`] if the transport rejects it.
    pub async fn notify(&self, channel: &str, message: Option<&str>) -> Result<(), NotifierError> {
        self.inner.transport.publish(channel, message.unwrap_or_default()).await
    }

    /// Number of channels with at least one local subscriber.
    #[must_use]
    pub fn active_channels(&self) -> usize {
        self.inner.state().channels.len()
    }

    /// Whether the transport has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Local subscriber count for `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .state()
            .channels
            .get(channel)
            .map_or(0, |entry| entry.refcount)
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("active_channels", &self.active_channels())
            .finish_non_exhaustive()
    }
}

async fn dispatch(inner: Weak<Inner>, mut incoming: IncomingReceiver) {
    while let Some(message) = incoming.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let state = inner.state();
        if let Some(entry) = state.channels.get(&message.channel) {
            // No receivers only means everyone is mid-unsubscribe.
            let _ = entry.sender.send(WakeSignal {
                payload: message.payload,
            });
        }
    }

    // The transport stopped delivering. Dropping the channel senders ends
    // every subscriber's `recv`, and later subscribes fail.
    if let Some(inner) = inner.upgrade() {
        let mut state = inner.state();
        state.closed = true;
        let channels = state.channels.len();
        state.channels.clear();
        drop(state);
        tracing::warn!(channels, "Notifier transport shut down");
    }
    tracing::debug!("Notifier dispatch loop finished");
}

/// One local subscriber's handle on a channel.
///
/// Dropping the handle releases the reference; when the last handle goes
/// away the transport unsubscribe runs on a background task. Prefer
/// [`ChannelSubscription::unsubscribe`] when the caller can await it.
pub struct ChannelSubscription {
    channel: String,
    generation: u64,
    receiver: broadcast::Receiver<WakeSignal>,
    inner: Option<Arc<Inner>>,
}

impl ChannelSubscription {
    /// The channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next wake signal.
    ///
    /// Returns `None` once the notifier has shut down. Signals lost to buffer
    /// overflow collapse into a single wake.
    pub async fn recv(&mut self) -> Option<WakeSignal> {
        match self.receiver.recv().await {
            Ok(signal) => Some(signal),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::trace!(channel = %self.channel, skipped, "Wake signals coalesced");
                Some(WakeSignal::default())
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Consume every wake signal already queued, returning how many there were.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(_) => drained += 1,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    drained += usize::try_from(skipped).unwrap_or(usize::MAX).max(1);
                }
                Err(_) => return drained,
            }
        }
    }

    /// Release this subscriber, awaiting the transport unsubscribe if it
    /// was the last one.
    pub async fn unsubscribe(mut self) {
        if let Some(teardown) = self.release() {
            teardown.await;
        }
    }

    fn release(&mut self) -> Option<BoxFuture<'static, ()>> {
        let inner = self.inner.take()?;
        inner.release(&self.channel, self.generation)
    }

    // The shared subscribe failed: the entry is gone, nothing to release.
    fn abandon(&mut self) {
        if let Some(inner) = self.inner.take() {
            let mut state = inner.state();
            if state
                .channels
                .get(&self.channel)
                .is_some_and(|entry| entry.generation == self.generation)
            {
                state.channels.remove(&self.channel);
            }
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        if let Some(teardown) = self.release() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(teardown);
                }
                Err(_) => {
                    tracing::warn!(channel = %self.channel, "No runtime to run channel unsubscribe");
                }
            }
        }
    }
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("channel", &self.channel)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
