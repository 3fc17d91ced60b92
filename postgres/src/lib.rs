//! `PostgreSQL` backend for evlog.
//!
//! This crate provides a PostgreSQL-based event log that implements the
//! `EventLog` trait from `evlog-core`. It uses sqlx and supports:
//!
//! - Atomic multi-event inserts
//! - Filters pushed down into SQL
//! - Live reads woken by `LISTEN`/`NOTIFY`
//! - Sliding-window rate limiting over stored events
//!
//! # Example
//!
//! ```no_run
//! use evlog_core::{EventLog, InsertMetadata, StreamKey};
//! use evlog_postgres::PostgresEventLog;
//! use serde_json::json;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let log = PostgresEventLog::builder()
//!         .database_url("postgres://localhost/evlog")
//!         .build()
//!         .await?;
//!     log.migrate().await?;
//!     log.insert_event(StreamKey::new("chat"), json!("hello"), InsertMetadata::new()).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod event_log;
pub mod listener;
mod sql;
pub mod throttle;

pub use event_log::{PostgresEventLog, PostgresEventLogBuilder};
pub use listener::PgNotifyTransport;
pub use throttle::ThrottleError;
