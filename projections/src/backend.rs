//! Storage seam for projections.
//!
//! A backend keeps two things side by side: the derived state (sets and
//! lists named by operation targets) and one durable cursor per projection
//! key. Applying a batch is a compare-and-swap on that cursor: the
//! operations and the new cursor are committed together, and only if the
//! cursor still holds the value read when the transaction began.
//!
//! # Implementations
//!
//! - [`RedisProjectionBackend`](crate::redis::RedisProjectionBackend): `WATCH` + `MULTI`/`EXEC`
//!   on a dedicated pooled connection
//! - [`PostgresProjectionBackend`](crate::postgres::PostgresProjectionBackend): conditional
//!   `UPDATE` of the cursor row inside a transaction
//! - `InMemoryProjectionBackend` (in `evlog-testing`)

use crate::error::Result;
use crate::operation::Operation;
use evlog_core::stream::Cursor;
use futures::future::BoxFuture;
use std::collections::BTreeSet;

/// Result of [`ProjectionTransaction::commit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Operations and cursor were written.
    Committed,
    /// The cursor moved since the transaction began; nothing was written.
    Conflict,
}

/// Projection storage.
pub trait ProjectionBackend: Send + Sync + 'static {
    /// Read the durable cursor for `key` (`None` if never committed).
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError::Storage` if the read fails.
    fn read_cursor<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Cursor>>>;

    /// Start an optimistic transaction on `key`'s cursor.
    ///
    /// The returned transaction holds whatever the backend needs to detect
    /// a concurrent commit (a watched connection, the expected value).
    ///
    /// # Errors
    ///
    /// - `ProjectionError::Pool`: no connection available
    /// - `ProjectionError::Storage`: the cursor could not be read
    fn begin<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Box<dyn ProjectionTransaction>>>;

    /// Current members of the set `target`.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError::Storage` if the read fails.
    fn members<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<BTreeSet<String>>>;
}

/// An open optimistic transaction.
pub trait ProjectionTransaction: Send {
    /// The cursor as read when the transaction began.
    fn current_cursor(&self) -> Option<Cursor>;

    /// Apply `operations` in order and set the cursor to `cursor`, all or
    /// nothing, unless the cursor changed since [`ProjectionBackend::begin`].
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError::Storage` on I/O failure. A lost race is
    /// not an error: it yields [`CommitOutcome::Conflict`].
    fn commit(self: Box<Self>, operations: Vec<Operation>, cursor: Cursor)
    -> BoxFuture<'static, Result<CommitOutcome>>;

    /// Give up without writing.
    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Channel and storage name for a target's derived state.
#[must_use]
pub fn state_key(target: &str) -> String {
    format!("projection:{target}")
}

/// Storage name of a projection's durable cursor.
#[must_use]
pub fn cursor_key(key: &str) -> String {
    format!("projection:{key}:cursor")
}
