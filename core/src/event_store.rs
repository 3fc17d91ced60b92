//! The event log contract shared by every backend.
//!
//! An event log stores opaque JSON values in append-only streams and serves
//! them back in write order. Reads come in two flavours:
//!
//! - [`EventLog::query`]: one read after a cursor
//! - [`EventLog::observable`]: the same read re-run whenever the stream is
//!   written to, as an unbounded [`LiveStream`] of pages
//!
//! # Implementations
//!
//! - `PostgresEventLog` (in `evlog-postgres`): rows in one table, wakes via `LISTEN/NOTIFY`
//! - `RedisEventLog` (in `evlog-redis`): one list per stream, wakes via `PUBLISH`
//! - `InMemoryEventLog` (in `evlog-testing`): for tests
//!
//! # Example
//!
//! ```no_run
//! use evlog_core::event_store::{EventLog, EventStoreError, QueryOptions};
//! use evlog_core::event::InsertMetadata;
//! use evlog_core::stream::StreamKey;
//! use futures::StreamExt;
//! use serde_json::json;
//!
//! async fn example<L: EventLog>(log: &L) -> Result<(), EventStoreError> {
//!     let key = StreamKey::new("chat");
//!     log.insert_event(key.clone(), json!({"text": "hi"}), InsertMetadata::new()).await?;
//!
//!     let mut live = log.observable(key, QueryOptions::new().tracking_cursor(None));
//!     while let Some(page) = live.next().await {
//!         let page = page?;
//!         println!("{} new events, resume from {:?}", page.events.len(), page.cursor);
//!     }
//!     Ok(())
//! }
//! ```

use crate::event::{EventView, IncludeMetadata, InsertMetadata, StoredEvent};
use crate::filter::{FilterError, Filters};
use crate::live::{LiveStream, StreamQuery};
use crate::notifier::{Notifier, NotifierError};
use crate::stream::{Cursor, StreamKey};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event log operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Database connection or statement error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A filter could not be compiled.
    #[error(transparent)]
    InvalidFilter(#[from] FilterError),

    /// Subscribing to live updates failed.
    #[error(transparent)]
    Notifier(#[from] NotifierError),
}

impl From<serde_json::Error> for EventStoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerializationError(error.to_string())
    }
}

/// Options for a read.
///
/// # Cursor tracking
///
/// With cursor tracking on, each [`Page`] carries the cursor to resume from
/// and live streams also emit empty pages (so a consumer can persist its
/// position). With it off, live streams skip empty pages.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    /// Attribute filters.
    pub filters: Filters,
    /// Read events strictly after this cursor (`None` reads from the start).
    pub after: Option<Cursor>,
    /// Whether the caller tracks the resume cursor.
    pub track_cursor: bool,
    /// Metadata returned with each event.
    pub include_metadata: IncludeMetadata,
}

impl QueryOptions {
    /// Read everything, no metadata, no cursor tracking.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to events matching `filters`.
    #[must_use]
    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    /// Track the cursor, starting after `cursor` (`None` = from the start).
    #[must_use]
    pub const fn tracking_cursor(mut self, cursor: Option<Cursor>) -> Self {
        self.after = cursor;
        self.track_cursor = true;
        self
    }

    /// Choose which metadata to return.
    #[must_use]
    pub fn with_metadata(mut self, include: IncludeMetadata) -> Self {
        self.include_metadata = include;
        self
    }

    /// Same options, reading after `cursor`.
    #[must_use]
    pub fn resumed_at(&self, cursor: Option<Cursor>) -> Self {
        Self {
            after: cursor,
            ..self.clone()
        }
    }
}

/// One read's worth of events.
#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    /// Matching events in write order.
    pub events: Vec<EventView>,
    /// Cursor to resume from. An empty page keeps the input cursor.
    pub cursor: Option<Cursor>,
}

impl Page {
    /// Build a page from the matching events of a read after `after`.
    ///
    /// The cursor is that of the last event, or `after` when nothing matched.
    #[must_use]
    pub fn from_events(events: &[StoredEvent], include: &IncludeMetadata, after: Option<Cursor>) -> Self {
        Self {
            events: events.iter().map(|event| event.view(include)).collect(),
            cursor: events.last().map(|event| event.cursor).or(after),
        }
    }

    /// Payloads only.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.events.iter().map(|event| event.value.clone()).collect()
    }

    /// Whether the page holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Event log abstraction.
///
/// # Guarantees
///
/// - Writes to one stream are totally ordered; reads return them in that order.
/// - `insert_events` is atomic: all values are visible or none are.
/// - A read never returns an event at or before its input cursor.
/// - An event whose write completed before `observable` was subscribed is
///   emitted exactly once, in the initial page or a later one.
///
/// # Dyn Compatibility
///
/// Returns `Pin<Box<dyn Future>>` so logs can be held as `Arc<dyn EventLog>`.
pub trait EventLog: Send + Sync {
    /// Append values to a stream and wake its observers.
    ///
    /// Returns the cursor assigned to each value, in order. Resolves once
    /// the write is durable; the wake is sent afterwards and a failed wake
    /// does not fail the insert.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: the write failed (nothing was written)
    /// - `SerializationError`: a value could not be encoded
    fn insert_events(
        &self,
        key: StreamKey,
        values: Vec<Value>,
        metadata: InsertMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Cursor>, EventStoreError>> + Send + '_>>;

    /// Append a single value.
    ///
    /// # Errors
    ///
    /// Same as [`EventLog::insert_events`].
    fn insert_event(
        &self,
        key: StreamKey,
        value: Value,
        metadata: InsertMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<Cursor, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let cursors = self.insert_events(key, vec![value], metadata).await?;
            cursors.into_iter().next().ok_or_else(|| {
                EventStoreError::DatabaseError("insert returned no cursor".to_string())
            })
        })
    }

    /// Read matching events after `options.after`.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: the read failed
    /// - `SerializationError`: a stored record could not be decoded
    fn query(
        &self,
        key: StreamKey,
        options: QueryOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Page, EventStoreError>> + Send + '_>>;

    /// Live read: the initial page, then one page per batch of new writes.
    ///
    /// Empty pages are emitted only when cursor tracking is on. The first
    /// error ends the stream.
    fn observable(&self, key: StreamKey, options: QueryOptions) -> LiveStream<Page, EventStoreError>;
}

/// Build an [`EventLog::observable`] stream from a log's `query`.
///
/// Backends call this from their `observable` with a clone of themselves
/// and the notifier carrying their stream wakes (channel name = stream key).
pub fn observe<L>(
    log: &L,
    notifier: &Notifier,
    key: StreamKey,
    options: QueryOptions,
    buffer: usize,
) -> LiveStream<Page, EventStoreError>
where
    L: EventLog + Clone + 'static,
{
    let channel = key.as_str().to_string();
    let track_cursor = options.track_cursor;
    let initial = options.after;
    let log = log.clone();

    StreamQuery::new(
        move |after: Option<Cursor>| {
            let log = log.clone();
            let key = key.clone();
            let options = options.resumed_at(after);
            async move { log.query(key, options).await }
        },
        initial,
        |after, page: &Page| page.cursor.or(*after),
        move |page, _| (track_cursor || !page.is_empty()).then_some(page),
    )
    .with_buffer(buffer)
    .spawn(notifier, channel)
}

/// Settings shared by every backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    /// Recorded as `processId` on every insert. Defaults to [`process_id`](crate::event::process_id).
    pub process_id: String,
    /// Results buffered between a live query and its consumer.
    pub live_buffer: usize,
    /// Wake signals buffered per channel before coalescing.
    pub channel_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            process_id: crate::event::process_id().to_string(),
            live_buffer: crate::live::DEFAULT_BUFFER,
            channel_capacity: crate::notifier::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl LogConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the process id.
    #[must_use]
    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = process_id.into();
        self
    }

    /// Set the live result buffer.
    #[must_use]
    pub fn with_live_buffer(mut self, buffer: usize) -> Self {
        self.live_buffer = buffer.max(1);
        self
    }

    /// Set the per-channel wake buffer.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}
