//! Bounded pool of dedicated connections.
//!
//! Some backend operations need a connection nobody else is using for the
//! duration of a unit of work (an optimistic transaction holds `WATCH` state
//! on its connection, for instance). The pool hands out at most
//! `max_size` such connections; further callers wait, up to the acquire
//! timeout, for one to come back.
//!
//! Connections are returned automatically when the [`Pooled`] guard drops,
//! on every path, including errors and cancellation.

use futures::future::BoxFuture;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No connection became available within the acquire timeout.
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),

    /// The manager failed to open a new connection.
    #[error("Failed to create connection: {0}")]
    CreateFailed(String),

    /// The pool has been closed.
    #[error("Pool closed")]
    Closed,
}

/// Creates connections for a [`Pool`].
pub trait Manager: Send + Sync + 'static {
    /// Connection type handed out.
    type Connection: Send + 'static;

    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::CreateFailed`] if the backend is unreachable.
    fn create(&self) -> BoxFuture<'_, Result<Self::Connection, PoolError>>;
}

/// Pool sizing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum connections checked out at once.
    pub max_size: usize,
    /// How long `acquire` waits before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum size (at least 1).
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Snapshot of pool usage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections currently checked out.
    pub in_use: usize,
    /// Idle connections kept for reuse.
    pub idle: usize,
    /// Total successful acquisitions.
    pub acquired: u64,
    /// Total releases (returned or discarded).
    pub released: u64,
}

struct PoolInner<M: Manager> {
    manager: M,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<M::Connection>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// A bounded connection pool.
pub struct Pool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Manager> Pool<M> {
    /// Create a pool. No connections are opened until first use.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager,
                permits: Arc::new(Semaphore::new(config.max_size.max(1))),
                config,
                idle: Mutex::new(Vec::new()),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Check out a connection, opening one if none are idle.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Timeout`] if the pool stays exhausted past the timeout
    /// - [`PoolError::CreateFailed`] if opening a connection fails
    /// - [`PoolError::Closed`] after [`Pool::close`]
    pub async fn acquire(&self) -> Result<Pooled<M>, PoolError> {
        let timeout = self.inner.config.acquire_timeout;
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_| PoolError::Timeout(timeout))?
            .map_err(|_| PoolError::Closed)?;

        let idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let connection = match idle {
            Some(connection) => connection,
            None => self.inner.manager.create().await?,
        };

        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(Pooled {
            connection: Some(connection),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Current usage.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let max = self.inner.config.max_size.max(1);
        PoolStatus {
            in_use: max.saturating_sub(self.inner.permits.available_permits()),
            idle: self
                .inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
        }
    }

    /// Access the manager.
    #[must_use]
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Refuse further acquisitions and drop idle connections.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct Pooled<M: Manager> {
    connection: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: Manager> Pooled<M> {
    /// Drop the connection instead of returning it (e.g. its state is unknown
    /// after an error). The slot is still freed.
    pub fn discard(mut self) {
        self.connection = None;
    }
}

impl<M: Manager> Deref for Pooled<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the connection, and both consume the guard.
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection taken before drop"))
    }
}

impl<M: Manager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled connection taken before drop"))
    }
}

impl<M: Manager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if !self.pool.permits.is_closed() {
                self.pool
                    .idle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(connection);
            }
        }
        self.pool.released.fetch_add(1, Ordering::Relaxed);
    }
}
