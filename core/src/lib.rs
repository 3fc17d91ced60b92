//! # evlog core
//!
//! Backend-independent pieces of the evlog event log client.
//!
//! ## Core Concepts
//!
//! - **Stream**: an append-only log of opaque JSON values, named by a [`StreamKey`](stream::StreamKey)
//! - **Cursor**: a resume position inside a stream
//! - **Filters**: attribute conditions compiled to SQL or to an in-process predicate
//! - **Notifier**: reference-counted channel subscriptions over a pub/sub transport
//! - **Live query**: a cursor query re-run on every wake, with coalescing and backpressure
//!
//! ## Architecture
//!
//! ```text
//!  insert_events ──► storage ──► notify(key)
//!                                   │
//!                          pub/sub transport
//!                                   │
//!                               Notifier ──► StreamQuery ──► query(after cursor) ──► LiveStream<Page>
//! ```
//!
//! Backends (`evlog-postgres`, `evlog-redis`) implement [`EventLog`](event_store::EventLog)
//! and [`PubSubTransport`](notifier::PubSubTransport); everything else lives here.

pub mod batches;
pub mod event;
pub mod event_store;
pub mod filter;
pub mod live;
pub mod notifier;
pub mod pool;
pub mod stream;

// Re-export commonly used types
pub use batches::BatchStreamExt;
pub use chrono::{DateTime, Utc};
pub use event::{EventView, IncludeMetadata, InsertMetadata, MetadataField, StoredEvent};
pub use event_store::{EventLog, EventStoreError, LogConfig, Page, QueryOptions};
pub use filter::{AttributeKind, Condition, Filters, Predicate};
pub use live::{LiveStream, StreamQuery};
pub use notifier::{ChannelSubscription, Notifier, NotifierError, PubSubTransport};
pub use stream::{Cursor, StreamKey};

/// Injected dependencies.
///
/// All time reads go through [`Clock`](environment::Clock) so tests can pin
/// timestamps (see `FixedClock` in `evlog-testing`).
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
