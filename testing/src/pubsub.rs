//! In-memory pub/sub.
//!
//! An [`InMemoryBroker`] stands in for the Redis server or the `PostgreSQL`
//! `LISTEN` machinery: every [`InMemoryPubSub`] attached to it sees what any
//! of them publishes on a channel it subscribed to. Attach one per simulated
//! process to test cross-instance wakes.

#![allow(clippy::missing_panics_doc)]

use evlog_core::notifier::{
    IncomingSender, Notifier, NotifierError, PubSubTransport, TransportMessage, incoming_channel,
};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Peer {
    channels: HashSet<String>,
    incoming: IncomingSender,
}

#[derive(Default)]
struct BrokerState {
    peers: HashMap<u64, Peer>,
}

/// Shared message bus for [`InMemoryPubSub`] transports.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_peer: Arc<AtomicU64>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a transport delivering into `incoming`.
    #[must_use]
    pub fn transport(&self, incoming: IncomingSender) -> InMemoryPubSub {
        let id = self.next_peer.fetch_add(1, Ordering::SeqCst);
        self.state().peers.insert(
            id,
            Peer {
                channels: HashSet::new(),
                incoming,
            },
        );
        InMemoryPubSub {
            broker: self.clone(),
            id,
            stats: PubSubStats::default(),
        }
    }

    /// A notifier attached to this broker, plus its call counters.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn notifier(&self) -> (Notifier, PubSubStats) {
        let (tx, rx) = incoming_channel();
        let transport = self.transport(tx);
        let stats = transport.stats();
        (Notifier::new(transport, rx), stats)
    }

    /// Deliver `payload` to every subscriber of `channel`, as an external
    /// writer would. Returns how many transports received it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let state = self.state();
        let mut delivered = 0;
        for peer in state.peers.values().filter(|p| p.channels.contains(channel)) {
            let sent = peer.incoming.send(TransportMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
            if sent.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of transports subscribed to `channel`.
    #[must_use]
    pub fn subscribers(&self, channel: &str) -> usize {
        self.state()
            .peers
            .values()
            .filter(|p| p.channels.contains(channel))
            .count()
    }
}

/// Call counters and fault switches for one [`InMemoryPubSub`].
#[derive(Clone, Debug, Default)]
pub struct PubSubStats {
    subscribes: Arc<AtomicUsize>,
    unsubscribes: Arc<AtomicUsize>,
    publishes: Arc<AtomicUsize>,
    fail_subscribe: Arc<AtomicBool>,
    fail_publish: Arc<AtomicBool>,
}

impl PubSubStats {
    /// Transport subscribe calls so far.
    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Transport unsubscribe calls so far.
    #[must_use]
    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Publish calls so far.
    #[must_use]
    pub fn publish_calls(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    /// Make subscribe calls fail until switched off.
    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Make publish calls fail until switched off.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

/// [`PubSubTransport`] over an [`InMemoryBroker`].
pub struct InMemoryPubSub {
    broker: InMemoryBroker,
    id: u64,
    stats: PubSubStats,
}

impl InMemoryPubSub {
    /// Counters for this transport.
    #[must_use]
    pub fn stats(&self) -> PubSubStats {
        self.stats.clone()
    }
}

impl PubSubTransport for InMemoryPubSub {
    fn subscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), NotifierError>> {
        Box::pin(async move {
            self.stats.subscribes.fetch_add(1, Ordering::SeqCst);
            if self.stats.fail_subscribe.load(Ordering::SeqCst) {
                return Err(NotifierError::SubscribeFailed {
                    channel: channel.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            if let Some(peer) = self.broker.state().peers.get_mut(&self.id) {
                peer.channels.insert(channel.to_string());
            }
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Result<(), NotifierError>> {
        Box::pin(async move {
            self.stats.unsubscribes.fetch_add(1, Ordering::SeqCst);
            if let Some(peer) = self.broker.state().peers.get_mut(&self.id) {
                peer.channels.remove(channel);
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<(), NotifierError>> {
        Box::pin(async move {
            self.stats.publishes.fetch_add(1, Ordering::SeqCst);
            if self.stats.fail_publish.load(Ordering::SeqCst) {
                return Err(NotifierError::PublishFailed {
                    channel: channel.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            self.broker.publish(channel, payload);
            Ok(())
        })
    }
}

impl Drop for InMemoryPubSub {
    fn drop(&mut self) {
        self.broker.state().peers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_only_subscribed_peers() {
        let broker = InMemoryBroker::new();
        let (tx_a, mut rx_a) = incoming_channel();
        let (tx_b, mut rx_b) = incoming_channel();
        let a = broker.transport(tx_a);
        let b = broker.transport(tx_b);

        a.subscribe("chat").await.ok();
        b.publish("chat", "hi").await.ok();
        b.publish("other", "ignored").await.ok();

        let message = rx_a.try_recv().ok();
        assert_eq!(message.map(|m| (m.channel, m.payload)), Some(("chat".into(), "hi".into())));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(b.stats().publish_calls(), 2);
    }

    #[tokio::test]
    async fn injected_subscribe_failure() {
        let broker = InMemoryBroker::new();
        let (tx, _rx) = incoming_channel();
        let transport = broker.transport(tx);
        transport.stats().fail_subscribes(true);

        assert!(transport.subscribe("chat").await.is_err());
        assert_eq!(broker.subscribers("chat"), 0);
        assert_eq!(transport.stats().subscribe_calls(), 1);
    }
}
