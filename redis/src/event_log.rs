//! Redis event log.
//!
//! # Layout
//!
//! - `evlog:stream:{key}`: list of JSON records, oldest first
//! - `evlog:seq:{key}`: counter of records ever pushed to the list
//!
//! The prefixes keep stream keys from colliding with each other's counters
//! or with projection state. Wakes are published on the bare stream key.
//!
//! The counter and the list are updated in the same `MULTI`, so the counter
//! always equals the list length and the `INCRBY` reply fixes the position of
//! every pushed record. A cursor is a list position: a read fetches
//! `LRANGE evlog:stream:{key} cursor -1`, filters in-process and returns the
//! position of the last matching record, or the input cursor when nothing
//! matched.

use crate::connections::RedisConnections;
use crate::pubsub::RedisPubSub;
use evlog_core::environment::{Clock, SystemClock};
use evlog_core::event::{EventMetadata, InsertMetadata, StoredEvent};
use evlog_core::event_store::{EventLog, EventStoreError, LogConfig, Page, QueryOptions, observe};
use evlog_core::live::LiveStream;
use evlog_core::notifier::{Notifier, incoming_channel};
use evlog_core::pool::PoolConfig;
use evlog_core::stream::{Cursor, StreamKey};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Stored list entry.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    value: Value,
    #[serde(flatten)]
    metadata: EventMetadata,
}

/// Redis list holding the records of `key`.
#[must_use]
pub fn list_key(key: &StreamKey) -> String {
    format!("evlog:stream:{key}")
}

/// Redis counter of records ever pushed under `key`.
#[must_use]
pub fn sequence_key(key: &StreamKey) -> String {
    format!("evlog:seq:{key}")
}

struct Inner {
    connections: RedisConnections,
    notifier: Notifier,
    config: LogConfig,
    clock: Arc<dyn Clock>,
}

/// Event log stored in Redis lists.
///
/// Cheap to clone; clones share connections and the subscriber.
///
/// # Example
///
/// ```no_run
/// use evlog_redis::RedisEventLog;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = RedisEventLog::builder()
///     .redis_url("redis://127.0.0.1:6379")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisEventLog {
    inner: Arc<Inner>,
}

impl RedisEventLog {
    /// Start building a log.
    #[must_use]
    pub fn builder() -> RedisEventLogBuilder {
        RedisEventLogBuilder::default()
    }

    /// Create a log over existing connections.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Notifier`] if the subscriber connection
    /// cannot be opened.
    pub async fn from_connections(
        connections: RedisConnections,
        config: LogConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EventStoreError> {
        let (incoming_tx, incoming_rx) = incoming_channel();
        let transport =
            RedisPubSub::connect(connections.client().clone(), connections.global(), incoming_tx)
                .await?;
        let notifier = Notifier::with_capacity(transport, incoming_rx, config.channel_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                connections,
                notifier,
                config,
                clock,
            }),
        })
    }

    /// The connections this log uses.
    #[must_use]
    pub fn connections(&self) -> &RedisConnections {
        &self.inner.connections
    }

    /// The notifier carrying this log's stream wakes.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    async fn push_records(
        &self,
        key: &StreamKey,
        values: Vec<Value>,
        metadata: InsertMetadata,
    ) -> Result<Vec<Cursor>, EventStoreError> {
        let stamped = metadata.stamp(self.inner.clock.now(), self.inner.config.process_id.clone());
        let records = values
            .into_iter()
            .map(|value| {
                serde_json::to_string(&Record {
                    value,
                    metadata: stamped.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let count = records.len() as u64;

        let mut conn = self.inner.connections.global();
        let (end,): (u64,) = redis::pipe()
            .atomic()
            .incr(sequence_key(key), count)
            .rpush(list_key(key), records)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to push events: {e}")))?;

        let start = end.saturating_sub(count);
        Ok((1..=count).map(|i| Cursor::new(start + i)).collect())
    }

    async fn read_page(&self, key: &StreamKey, options: &QueryOptions) -> Result<Page, EventStoreError> {
        let offset = Cursor::offset_of(options.after);
        let start = isize::try_from(offset)
            .map_err(|_| EventStoreError::DatabaseError("Cursor out of range".to_string()))?;

        let mut conn = self.inner.connections.global();
        let raw: Vec<String> = conn
            .lrange(list_key(key), start, -1)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to read events: {e}")))?;

        let predicate = options.filters.to_predicate();
        let mut matched = Vec::new();
        for (position, entry) in (offset + 1..).zip(&raw) {
            let record: Record = serde_json::from_str(entry)?;
            let event = StoredEvent {
                cursor: Cursor::new(position),
                value: record.value,
                metadata: record.metadata,
            };
            if predicate.matches(&event.attributes()) {
                matched.push(event);
            }
        }

        Ok(Page::from_events(&matched, &options.include_metadata, options.after))
    }
}

impl EventLog for RedisEventLog {
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
            let cursors = self.push_records(&key, values, metadata).await?;

            tracing::debug!(key = %key, count = cursors.len(), "Pushed events");
            metrics::counter!("evlog.events.inserted", "backend" => "redis")
                .increment(cursors.len() as u64);

            let notifier = self.inner.notifier.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(key.as_str(), None).await {
                    tracing::warn!(key = %key, error = %e, "Failed to notify stream");
                    metrics::counter!("evlog.notify.failed", "backend" => "redis").increment(1);
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
        Box::pin(async move { self.read_page(&key, &options).await })
    }

    fn observable(&self, key: StreamKey, options: QueryOptions) -> LiveStream<Page, EventStoreError> {
        observe(self, &self.inner.notifier, key, options, self.inner.config.live_buffer)
    }
}

/// Builder for [`RedisEventLog`].
pub struct RedisEventLogBuilder {
    redis_url: Option<String>,
    pool: PoolConfig,
    config: LogConfig,
    clock: Arc<dyn Clock>,
}

impl Default for RedisEventLogBuilder {
    fn default() -> Self {
        Self {
            redis_url: None,
            pool: PoolConfig::default(),
            config: LogConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl RedisEventLogBuilder {
    /// Redis URL (required), e.g. `redis://127.0.0.1:6379`.
    #[must_use]
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Dedicated connection pool sizing (default 10 connections, 30s timeout).
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Shared log settings.
    #[must_use]
    pub fn config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used to timestamp inserts (default: wall clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connect and start the subscriber.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::DatabaseError`] if no URL was given or Redis is unreachable
    /// - [`EventStoreError::Notifier`] if the subscriber connection fails
    pub async fn build(self) -> Result<RedisEventLog, EventStoreError> {
        let url = self
            .redis_url
            .ok_or_else(|| EventStoreError::DatabaseError("redis_url is required".to_string()))?;
        let connections = RedisConnections::connect(&url, self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to connect to Redis: {e}")))?;
        RedisEventLog::from_connections(connections, self.config, self.clock).await
    }
}
