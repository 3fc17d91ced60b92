//! Projections for evlog.
//!
//! # Overview
//!
//! A projection folds a resumable stream of operation batches into derived
//! state (sets and lists) and keeps a durable cursor next to that state:
//!
//! ```text
//! resumable(cursor) ──► batches ──► ProjectionEngine ──► ProjectionBackend
//!                                          │               (state + cursor)
//!                                          ▼
//!                                   notify(projection:{target}) ──► members(target)
//! ```
//!
//! Every commit is a compare-and-swap on the cursor, so several instances
//! can run the same projection key: the one that loses a race notices,
//! throws its pending work away and resubscribes from the durable cursor.
//!
//! # Backends
//!
//! - **Redis**: [`RedisProjectionBackend`] (`WATCH`/`MULTI`/`EXEC`)
//! - **`PostgreSQL`**: [`PostgresProjectionBackend`] (conditional cursor update)

pub mod backend;
pub mod engine;
pub mod error;
pub mod operation;
pub mod postgres;
pub mod redis;

// Re-export main types for convenience
pub use backend::{CommitOutcome, ProjectionBackend, ProjectionTransaction, cursor_key, state_key};
pub use engine::{ProjectionEngine, ProjectionHandle, ProjectionLog, ResumableSource, event_log_source};
pub use error::{ProjectionError, Result};
pub use operation::{Batch, OpCode, Operation};
pub use self::postgres::PostgresProjectionBackend;
pub use self::redis::RedisProjectionBackend;
