//! Projection engine.
//!
//! Folds a resumable stream of operation batches into derived state held
//! by a [`ProjectionBackend`], one optimistic transaction at a time.
//!
//! # Lifecycle
//!
//! ```text
//! SUBSCRIBING ──► STREAMING ◄──► APPLYING
//!      ▲                            │
//!      └──────── conflict ──────────┘
//!                   stop() ──► STOPPED
//! ```
//!
//! - **Subscribing**: read the durable cursor, remember it as the last
//!   known cursor and open the source at that position.
//! - **Streaming**: validate incoming batches and queue them. If no
//!   transaction is in flight, start one.
//! - **Applying**: begin a transaction on the cursor and compare it with the
//!   last known cursor, then commit every queued operation together with
//!   the newest batch cursor. Batches that arrive meanwhile wait for the
//!   next transaction.
//!   - Conflict (cursor moved, before or at commit): discard the queue and
//!     resubscribe. The source replays from the durable cursor, so nothing
//!     is lost; operations are idempotent, so replay is harmless.
//!   - Any other failure: keep the queue and retry when the next batch
//!     arrives.
//!   - Success: drop the applied batches and wake readers of every touched
//!     target.
//! - **Stopped**: the source is dropped. A transaction already in flight
//!   finishes, but its wakes are skipped.

use crate::backend::{CommitOutcome, ProjectionBackend, state_key};
use crate::error::{ProjectionError, Result};
use crate::operation::{Batch, Operation};
use evlog_core::event_store::{EventLog, QueryOptions};
use evlog_core::live::{LiveStream, StreamQuery};
use evlog_core::notifier::Notifier;
use evlog_core::stream::{Cursor, StreamKey};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Source of operation batches that can restart at a cursor.
///
/// `resume(None)` starts from the beginning; `resume(Some(c))` yields only
/// batches after `c`. Items are raw JSON so malformed batches can be
/// dropped individually (see [`Batch::from_json`]).
pub trait ResumableSource: Send + Sync + 'static {
    /// Open the source after `cursor`.
    fn resume(&self, cursor: Option<Cursor>) -> BoxStream<'static, Result<Value>>;
}

impl<F> ResumableSource for F
where
    F: Fn(Option<Cursor>) -> BoxStream<'static, Result<Value>> + Send + Sync + 'static,
{
    fn resume(&self, cursor: Option<Cursor>) -> BoxStream<'static, Result<Value>> {
        self(cursor)
    }
}

/// A source reading batches from an event log stream.
///
/// Each live page becomes one batch: its cursor is the page cursor and its
/// operations are the `operations` arrays of the page's events, in order.
pub fn event_log_source<L>(log: L, key: StreamKey) -> impl ResumableSource
where
    L: EventLog + 'static,
{
    move |cursor: Option<Cursor>| -> BoxStream<'static, Result<Value>> {
        let mut pages = log.observable(key.clone(), QueryOptions::new().tracking_cursor(cursor));
        Box::pin(async_stream::stream! {
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(ProjectionError::EventProcessing(e.to_string()));
                        break;
                    }
                };
                if page.is_empty() {
                    continue;
                }
                let Some(cursor) = page.cursor else { continue };
                let operations: Vec<Value> = page
                    .events
                    .iter()
                    .filter_map(|event| event.value.get("operations").and_then(Value::as_array))
                    .flatten()
                    .cloned()
                    .collect();
                yield Ok(json!({"cursor": cursor, "operations": operations}));
            }
        })
    }
}

/// Progress reported to an optional log sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProjectionLog {
    /// The source was (re)opened at `cursor`.
    Subscribed {
        /// Durable cursor at subscription time.
        cursor: Option<Cursor>,
    },
    /// A batch failed validation and was dropped.
    BatchDropped {
        /// Why.
        reason: String,
    },
    /// A transaction committed.
    Committed {
        /// New durable cursor.
        cursor: Cursor,
        /// Number of operations applied.
        operations: usize,
    },
    /// Another writer moved the cursor; the queue was discarded.
    Conflict {
        /// Cursor this instance expected.
        expected: Option<Cursor>,
    },
    /// A transaction failed; the queue is kept for the next attempt.
    TransactionFailed {
        /// Error message.
        error: String,
    },
    /// The source or the cursor read failed; the projection ends.
    Failed {
        /// Error message.
        error: String,
    },
    /// The projection task ended.
    Stopped,
}

/// Runs projections over a backend.
///
/// # Example
///
/// ```no_run
/// use evlog_projections::{ProjectionEngine, RedisProjectionBackend, event_log_source};
/// use evlog_core::stream::StreamKey;
/// use evlog_redis::RedisEventLog;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = RedisEventLog::builder().redis_url("redis://127.0.0.1:6379").build().await?;
/// let engine = ProjectionEngine::new(
///     RedisProjectionBackend::new(log.connections().clone()),
///     log.notifier().clone(),
/// );
///
/// let handle = engine.run("online", event_log_source(log.clone(), StreamKey::new("presence")));
/// // ...
/// handle.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProjectionEngine {
    backend: Arc<dyn ProjectionBackend>,
    notifier: Notifier,
    log_sink: Option<mpsc::UnboundedSender<ProjectionLog>>,
}

impl ProjectionEngine {
    /// Create an engine. `notifier` carries wakes for projection readers.
    pub fn new(backend: impl ProjectionBackend, notifier: Notifier) -> Self {
        Self::from_arc(Arc::new(backend), notifier)
    }

    /// Create an engine over a shared backend.
    #[must_use]
    pub fn from_arc(backend: Arc<dyn ProjectionBackend>, notifier: Notifier) -> Self {
        Self {
            backend,
            notifier,
            log_sink: None,
        }
    }

    /// Send progress reports to `sink`.
    #[must_use]
    pub fn with_log_sink(mut self, sink: mpsc::UnboundedSender<ProjectionLog>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ProjectionBackend> {
        &self.backend
    }

    /// Start projecting `source` under `key`.
    ///
    /// `key` names the durable cursor; operation targets name the state.
    /// The projection runs until [`ProjectionHandle::stop`] is called, the
    /// handle is dropped, or the source ends or fails.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run(&self, key: impl Into<String>, source: impl ResumableSource) -> ProjectionHandle {
        let key = key.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = Runner {
            key: key.clone(),
            backend: Arc::clone(&self.backend),
            notifier: self.notifier.clone(),
            source: Box::new(source),
            log_sink: self.log_sink.clone(),
        };
        let task = tokio::spawn(runner.run(stop_rx));
        ProjectionHandle {
            key,
            stop: stop_tx,
            task,
        }
    }

    /// Live view of the set `target`: its members now, then again after
    /// every commit that touches it.
    pub fn members(&self, target: &str) -> LiveStream<BTreeSet<String>, ProjectionError> {
        let backend = Arc::clone(&self.backend);
        let name = target.to_string();
        StreamQuery::new(
            move |()| {
                let backend = Arc::clone(&backend);
                let name = name.clone();
                async move { backend.members(&name).await }
            },
            (),
            |(), _: &BTreeSet<String>| (),
            |members, ()| Some(members),
        )
        .spawn(&self.notifier, state_key(target))
    }
}

/// Handle on a running projection. Dropping it stops the projection.
pub struct ProjectionHandle {
    key: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProjectionHandle {
    /// The projection key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop the projection. An in-flight transaction still completes.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Whether the projection task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop and wait for the task to end.
    pub async fn join(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::error!(projection = %self.key, error = %e, "Projection task panicked");
        }
    }

    /// Wait for the task to end on its own (source ended or failed).
    pub async fn finished(self) {
        let Self { key, stop, task } = self;
        if let Err(e) = task.await {
            tracing::error!(projection = %key, error = %e, "Projection task panicked");
        }
        drop(stop);
    }
}

/// Outcome of one transaction, with what it covered.
struct Applied {
    batches: usize,
    cursor: Cursor,
    operations: usize,
    targets: BTreeSet<String>,
    outcome: Result<CommitOutcome>,
}

type InFlight = BoxFuture<'static, Applied>;

enum Step {
    Stop,
    Applied(Applied),
    Item(Option<Result<Value>>),
}

enum Next {
    Resubscribe,
    Finish,
}

struct Runner {
    key: String,
    backend: Arc<dyn ProjectionBackend>,
    notifier: Notifier,
    source: Box<dyn ResumableSource>,
    log_sink: Option<mpsc::UnboundedSender<ProjectionLog>>,
}

impl Runner {
    fn report(&self, entry: ProjectionLog) {
        if let Some(sink) = &self.log_sink {
            let _ = sink.send(entry);
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        tracing::info!(projection = %self.key, "Starting projection");
        while let Next::Resubscribe = self.subscribe_and_apply(&mut stop).await {}
        tracing::info!(projection = %self.key, "Projection stopped");
        self.report(ProjectionLog::Stopped);
    }

    async fn subscribe_and_apply(&self, stop: &mut watch::Receiver<bool>) -> Next {
        let read = tokio::select! {
            biased;
            () = stopped(stop) => return Next::Finish,
            read = self.backend.read_cursor(&self.key) => read,
        };
        let mut last_cursor = match read {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::error!(projection = %self.key, error = %e, "Failed to read projection cursor");
                self.report(ProjectionLog::Failed { error: e.to_string() });
                return Next::Finish;
            }
        };

        tracing::debug!(projection = %self.key, cursor = ?last_cursor, "Subscribing to source");
        self.report(ProjectionLog::Subscribed { cursor: last_cursor });

        let mut source = Some(self.source.resume(last_cursor));
        let mut queue: Vec<Batch> = Vec::new();
        let mut in_flight: Option<InFlight> = None;

        loop {
            if source.is_none() && in_flight.is_none() {
                return Next::Finish;
            }

            let step = {
                let source_open = source.is_some();
                tokio::select! {
                    biased;
                    () = stopped(stop) => Step::Stop,
                    applied = wait_for(&mut in_flight) => Step::Applied(applied),
                    item = next_item(&mut source), if source_open => Step::Item(item),
                }
            };

            match step {
                Step::Stop => {
                    drop(source.take());
                    if let Some(pending) = in_flight.take() {
                        let applied = pending.await;
                        tracing::debug!(
                            projection = %self.key,
                            outcome = ?applied.outcome,
                            "In-flight transaction finished after stop, skipping wakes"
                        );
                    }
                    return Next::Finish;
                }
                Step::Item(None) => {
                    tracing::info!(projection = %self.key, "Projection source ended");
                    source = None;
                }
                Step::Item(Some(Err(e))) => {
                    tracing::error!(projection = %self.key, error = %e, "Projection source failed");
                    self.report(ProjectionLog::Failed { error: e.to_string() });
                    source = None;
                }
                Step::Item(Some(Ok(value))) => match Batch::from_json(&value) {
                    Ok(batch) => {
                        queue.push(batch);
                        if in_flight.is_none() {
                            in_flight = self.start(last_cursor, &queue);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(projection = %self.key, error = %e, "Dropping malformed batch");
                        self.report(ProjectionLog::BatchDropped { reason: e.to_string() });
                    }
                },
                Step::Applied(applied) => {
                    in_flight = None;
                    match applied.outcome {
                        Ok(CommitOutcome::Committed) => {
                            last_cursor = Some(applied.cursor);
                            queue.drain(..applied.batches.min(queue.len()));
                            metrics::counter!("evlog.projection.commits").increment(1);
                            tracing::debug!(
                                projection = %self.key,
                                cursor = %applied.cursor,
                                operations = applied.operations,
                                "Projection batch committed"
                            );
                            self.report(ProjectionLog::Committed {
                                cursor: applied.cursor,
                                operations: applied.operations,
                            });
                            self.wake(&applied.targets).await;
                            if !queue.is_empty() {
                                in_flight = self.start(last_cursor, &queue);
                            }
                        }
                        Ok(CommitOutcome::Conflict) => {
                            tracing::warn!(
                                projection = %self.key,
                                expected = ?last_cursor,
                                "Write conflict on projection cursor, another instance may be running on this key; resubscribing"
                            );
                            metrics::counter!("evlog.projection.conflicts").increment(1);
                            self.report(ProjectionLog::Conflict { expected: last_cursor });
                            return Next::Resubscribe;
                        }
                        Err(e) => {
                            tracing::error!(
                                projection = %self.key,
                                error = %e,
                                queued = queue.len(),
                                "Projection transaction failed, will retry on next batch"
                            );
                            self.report(ProjectionLog::TransactionFailed { error: e.to_string() });
                        }
                    }
                }
            }
        }
    }

    fn start(&self, expected: Option<Cursor>, queue: &[Batch]) -> Option<InFlight> {
        let cursor = queue.last()?.cursor;
        let batches = queue.len();
        let operations: Vec<Operation> = queue
            .iter()
            .flat_map(|batch| batch.operations.iter().cloned())
            .collect();
        let targets: BTreeSet<String> = operations.iter().map(|op| op.target.clone()).collect();
        let backend = Arc::clone(&self.backend);
        let key = self.key.clone();

        Some(Box::pin(async move {
            let count = operations.len();
            let outcome = apply(backend.as_ref(), &key, expected, operations, cursor).await;
            Applied {
                batches,
                cursor,
                operations: count,
                targets,
                outcome,
            }
        }))
    }

    async fn wake(&self, targets: &BTreeSet<String>) {
        for target in targets {
            if let Err(e) = self.notifier.notify(&state_key(target), None).await {
                tracing::warn!(projection = %self.key, target = %target, error = %e, "Failed to wake projection readers");
                metrics::counter!("evlog.notify.failed", "backend" => "projection").increment(1);
            }
        }
    }
}

async fn apply(
    backend: &dyn ProjectionBackend,
    key: &str,
    expected: Option<Cursor>,
    operations: Vec<Operation>,
    cursor: Cursor,
) -> Result<CommitOutcome> {
    let transaction = backend.begin(key).await?;
    if transaction.current_cursor() != expected {
        tracing::debug!(
            projection = %key,
            expected = ?expected,
            found = ?transaction.current_cursor(),
            "Projection cursor moved before commit"
        );
        transaction.rollback().await;
        return Ok(CommitOutcome::Conflict);
    }
    transaction.commit(operations, cursor).await
}

async fn wait_for(in_flight: &mut Option<InFlight>) -> Applied {
    match in_flight {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

async fn next_item(source: &mut Option<BoxStream<'static, Result<Value>>>) -> Option<Result<Value>> {
    match source {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        // Sender dropped: the handle is gone.
        if stop.changed().await.is_err() {
            return;
        }
    }
}
