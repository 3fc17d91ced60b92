//! In-memory event log.
//!
//! Behaves like the `PostgreSQL` backend without a database: one global id
//! sequence, and a page's cursor is the id of its last event, or the input
//! cursor when nothing matched. Filters run through the in-process
//! predicate. Queries can be paused or made to fail.

#![allow(clippy::missing_panics_doc)]

use crate::mocks::test_clock;
use crate::pubsub::{InMemoryBroker, PubSubStats};
use evlog_core::environment::Clock;
use evlog_core::event::{InsertMetadata, StoredEvent};
use evlog_core::event_store::{EventLog, EventStoreError, LogConfig, Page, QueryOptions, observe};
use evlog_core::live::LiveStream;
use evlog_core::notifier::Notifier;
use evlog_core::stream::{Cursor, StreamKey};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

struct Inner {
    streams: Mutex<HashMap<String, Vec<StoredEvent>>>,
    next_id: AtomicU64,
    notifier: Notifier,
    stats: PubSubStats,
    clock: Arc<dyn Clock>,
    config: LogConfig,
    query_calls: AtomicUsize,
    fail_queries: AtomicBool,
    paused: watch::Sender<bool>,
}

/// In-memory [`EventLog`] for tests.
///
/// # Example
///
/// ```
/// use evlog_testing::InMemoryEventLog;
/// use evlog_core::event_store::{EventLog, QueryOptions};
/// use evlog_core::event::InsertMetadata;
/// use evlog_core::stream::StreamKey;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryEventLog::new();
/// log.insert_event(StreamKey::new("chat"), json!("hi"), InsertMetadata::new()).await?;
///
/// let page = log.query(StreamKey::new("chat"), QueryOptions::new()).await?;
/// assert_eq!(page.values(), vec![json!("hi")]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryEventLog {
    inner: Arc<Inner>,
}

impl InMemoryEventLog {
    /// A log on its own broker, stamped by [`test_clock`].
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::on_broker(&InMemoryBroker::new(), Arc::new(test_clock()))
    }

    /// A log whose wakes travel over `broker`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn on_broker(broker: &InMemoryBroker, clock: Arc<dyn Clock>) -> Self {
        let (notifier, stats) = broker.notifier();
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                streams: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                notifier,
                stats,
                clock,
                config: LogConfig::default().with_process_id("test-process"),
                query_calls: AtomicUsize::new(0),
                fail_queries: AtomicBool::new(false),
                paused,
            }),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Vec<StoredEvent>>> {
        self.inner.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The notifier carrying stream wakes.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Transport counters for the notifier.
    #[must_use]
    pub fn pubsub_stats(&self) -> &PubSubStats {
        &self.inner.stats
    }

    /// Queries started so far (including those from live streams).
    #[must_use]
    pub fn query_calls(&self) -> usize {
        self.inner.query_calls.load(Ordering::SeqCst)
    }

    /// Make queries fail until switched off.
    pub fn fail_queries(&self, fail: bool) {
        self.inner.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Hold every query at its start until [`InMemoryEventLog::resume_queries`].
    pub fn pause_queries(&self) {
        self.inner.paused.send_replace(true);
    }

    /// Release paused queries.
    pub fn resume_queries(&self) {
        self.inner.paused.send_replace(false);
    }

    /// Every event in `key`, in write order.
    #[must_use]
    pub fn events(&self, key: &StreamKey) -> Vec<StoredEvent> {
        self.streams().get(key.as_str()).cloned().unwrap_or_default()
    }

    fn append(&self, key: &StreamKey, values: Vec<Value>, metadata: InsertMetadata) -> Vec<Cursor> {
        let stamped = metadata.stamp(self.inner.clock.now(), self.inner.config.process_id.clone());
        let mut streams = self.streams();
        let stream = streams.entry(key.as_str().to_string()).or_default();
        values
            .into_iter()
            .map(|value| {
                let cursor = Cursor::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
                stream.push(StoredEvent {
                    cursor,
                    value,
                    metadata: stamped.clone(),
                });
                cursor
            })
            .collect()
    }

    fn read(&self, key: &StreamKey, options: &QueryOptions) -> Page {
        let after = Cursor::offset_of(options.after);
        let predicate = options.filters.to_predicate();
        let streams = self.streams();
        let matched: Vec<StoredEvent> = streams
            .get(key.as_str())
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.cursor.value() > after && predicate.matches(&e.attributes()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Page::from_events(&matched, &options.include_metadata, options.after)
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog for InMemoryEventLog {
    fn insert_events(
        &self,
        key: StreamKey,
        values: Vec<Value>,
        metadata: InsertMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Cursor>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if values.is_empty() {
                return Ok(Vec::new());
            }
            let cursors = self.append(&key, values, metadata);

            let notifier = self.inner.notifier.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(key.as_str(), None).await {
                    tracing::warn!(key = %key, error = %e, "Failed to notify stream");
                }
            });
            Ok(cursors)
        })
    }

    fn query(
        &self,
        key: StreamKey,
        options: QueryOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Page, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.inner.query_calls.fetch_add(1, Ordering::SeqCst);
            let mut paused = self.inner.paused.subscribe();
            // The sender lives in `self`, so this only ends on resume.
            let _ = paused.wait_for(|paused| !*paused).await;

            if self.inner.fail_queries.load(Ordering::SeqCst) {
                return Err(EventStoreError::DatabaseError("injected failure".to_string()));
            }
            Ok(self.read(&key, &options))
        })
    }

    fn observable(&self, key: StreamKey, options: QueryOptions) -> LiveStream<Page, EventStoreError> {
        observe(self, &self.inner.notifier, key, options, self.inner.config.live_buffer)
    }
}
