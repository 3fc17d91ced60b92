//! In-memory projection storage.
//!
//! [`InMemoryProjectionBackend`] implements the compare-and-swap the way
//! Redis `WATCH` does: every write to a cursor bumps a version, a
//! transaction remembers the version it began at, and the commit fails if
//! the version moved. Transactions hold a connection from a real
//! [`Pool`], so tests can check that every checkout is returned.
//!
//! Failures and delays can be injected to exercise the engine's recovery
//! paths.

#![allow(clippy::missing_panics_doc)]

use evlog_core::pool::{Manager, Pool, PoolConfig, PoolError, PoolStatus, Pooled};
use evlog_core::stream::Cursor;
use evlog_projections::{
    CommitOutcome, OpCode, Operation, ProjectionBackend, ProjectionError, ProjectionTransaction,
};
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Hands out numbered fake connections.
#[derive(Default)]
pub struct FakeConnections {
    opened: AtomicU64,
}

impl Manager for FakeConnections {
    type Connection = u64;

    fn create(&self) -> BoxFuture<'_, Result<u64, PoolError>> {
        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(id) })
    }
}

#[derive(Default)]
struct Store {
    cursors: HashMap<String, (Cursor, u64)>,
    sets: HashMap<String, BTreeSet<String>>,
    lists: HashMap<String, Vec<String>>,
}

impl Store {
    fn version(&self, key: &str) -> u64 {
        self.cursors.get(key).map_or(0, |(_, version)| *version)
    }

    fn set_cursor(&mut self, key: &str, cursor: Cursor) {
        let version = self.version(key) + 1;
        self.cursors.insert(key.to_string(), (cursor, version));
    }

    fn apply(&mut self, operation: &Operation) {
        let target = operation.target.clone();
        match operation.op {
            OpCode::SetAdd => {
                self.sets.entry(target).or_default().extend(operation.args.iter().cloned());
            }
            OpCode::SetRemove => {
                if let Some(set) = self.sets.get_mut(&target) {
                    for member in &operation.args {
                        set.remove(member);
                    }
                }
            }
            OpCode::ListPush => {
                self.lists.entry(target).or_default().extend(operation.args.iter().cloned());
            }
        }
    }
}

#[derive(Default)]
struct Faults {
    fail_begins: AtomicUsize,
    fail_commits: AtomicUsize,
    lose_replies: AtomicUsize,
    commit_delay: Mutex<Option<Duration>>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory [`ProjectionBackend`].
///
/// # Example
///
/// ```
/// use evlog_testing::InMemoryProjectionBackend;
///
/// let backend = InMemoryProjectionBackend::new();
/// assert!(backend.members_now("online").is_empty());
/// assert_eq!(backend.pool_status().in_use, 0);
/// ```
#[derive(Clone)]
pub struct InMemoryProjectionBackend {
    store: Arc<Mutex<Store>>,
    pool: Pool<FakeConnections>,
    faults: Arc<Faults>,
    commits: Arc<AtomicUsize>,
}

impl InMemoryProjectionBackend {
    /// Create an empty backend with a 4-connection pool.
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool(PoolConfig::new().with_max_size(4))
    }

    /// Create an empty backend with the given pool sizing.
    #[must_use]
    pub fn with_pool(config: PoolConfig) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            pool: Pool::new(FakeConnections::default(), config),
            faults: Arc::new(Faults::default()),
            commits: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Members of `target` right now.
    #[must_use]
    pub fn members_now(&self, target: &str) -> BTreeSet<String> {
        self.store().sets.get(target).cloned().unwrap_or_default()
    }

    /// Values of the list `target` right now.
    #[must_use]
    pub fn list_now(&self, target: &str) -> Vec<String> {
        self.store().lists.get(target).cloned().unwrap_or_default()
    }

    /// Durable cursor of `key` right now.
    #[must_use]
    pub fn cursor_now(&self, key: &str) -> Option<Cursor> {
        self.store().cursors.get(key).map(|(cursor, _)| *cursor)
    }

    /// Successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Write `key`'s cursor from outside, as a competing writer would.
    pub fn overwrite_cursor(&self, key: &str, cursor: Cursor) {
        self.store().set_cursor(key, cursor);
    }

    /// Fail the next `n` calls to `begin`.
    pub fn fail_next_begins(&self, n: usize) {
        self.faults.fail_begins.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commits (before anything is written).
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` commits but report them as failed, as when the
    /// connection drops before the reply arrives.
    pub fn lose_next_commit_replies(&self, n: usize) {
        self.faults.lose_replies.store(n, Ordering::SeqCst);
    }

    /// Sleep this long inside every commit, before the version check.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        *self.faults.commit_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Pool usage; `acquired == released` once every transaction has ended.
    #[must_use]
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }
}

impl Default for InMemoryProjectionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionBackend for InMemoryProjectionBackend {
    fn read_cursor<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Cursor>, ProjectionError>> {
        Box::pin(async move { Ok(self.cursor_now(key)) })
    }

    fn begin<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn ProjectionTransaction>, ProjectionError>> {
        Box::pin(async move {
            let connection = self.pool.acquire().await?;
            if take_one(&self.faults.fail_begins) {
                return Err(ProjectionError::Storage("injected begin failure".to_string()));
            }
            let (current, version) = {
                let store = self.store();
                (store.cursors.get(key).map(|(c, _)| *c), store.version(key))
            };
            Ok(Box::new(InMemoryTransaction {
                backend: self.clone(),
                _connection: connection,
                key: key.to_string(),
                current,
                version,
            }) as Box<dyn ProjectionTransaction>)
        })
    }

    fn members<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<BTreeSet<String>, ProjectionError>> {
        Box::pin(async move { Ok(self.members_now(target)) })
    }
}

struct InMemoryTransaction {
    backend: InMemoryProjectionBackend,
    _connection: Pooled<FakeConnections>,
    key: String,
    current: Option<Cursor>,
    version: u64,
}

impl ProjectionTransaction for InMemoryTransaction {
    fn current_cursor(&self) -> Option<Cursor> {
        self.current
    }

    fn commit(
        self: Box<Self>,
        operations: Vec<Operation>,
        cursor: Cursor,
    ) -> BoxFuture<'static, Result<CommitOutcome, ProjectionError>> {
        Box::pin(async move {
            let delay = *self
                .backend
                .faults
                .commit_delay
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if take_one(&self.backend.faults.fail_commits) {
                return Err(ProjectionError::Storage("injected commit failure".to_string()));
            }

            let mut store = self.backend.store();
            if store.version(&self.key) != self.version {
                return Ok(CommitOutcome::Conflict);
            }
            for operation in &operations {
                store.apply(operation);
            }
            store.set_cursor(&self.key, cursor);
            drop(store);

            self.backend.commits.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.backend.faults.lose_replies) {
                return Err(ProjectionError::Storage("injected lost commit reply".to_string()));
            }
            Ok(CommitOutcome::Committed)
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { drop(self) })
    }
}
