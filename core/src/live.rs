//! Live query streams.
//!
//! A [`StreamQuery`] turns a one-shot cursor query into an unbounded stream:
//! it runs the query once, then re-runs it every time the channel it watches
//! is woken, feeding each result's cursor into the next call.
//!
//! Guarantees:
//!
//! - At most one query is in flight per stream.
//! - Any number of wakes that arrive while a query is running collapse into
//!   exactly one follow-up query.
//! - The cursor passed to each query is the one produced by the previous
//!   result, so every result is emitted exactly once and in order.
//! - The consumer applies backpressure: no new query starts until the
//!   previous result has been handed over.
//! - Cancelling (or dropping) the stream releases the channel subscription.
//!   A query already in flight is allowed to finish and its result is
//!   discarded.
//!
//! The first error ends the stream. A notifier that shuts down under a
//! running stream ends it with [`NotifierError::Closed`], so a stream that
//! simply stops yielding has always been cancelled.

use crate::notifier::{Notifier, NotifierError};
use futures::Stream;
use futures::future::{BoxFuture, FutureExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};

/// Default number of results buffered between the query task and its consumer.
pub const DEFAULT_BUFFER: usize = 1;

type QueryFn<C, R, E> = Box<dyn FnMut(C) -> BoxFuture<'static, Result<R, E>> + Send>;
type AdvanceFn<C, R> = Box<dyn FnMut(&C, &R) -> C + Send>;
type TransformFn<C, R, T> = Box<dyn FnMut(R, &C) -> Option<T> + Send>;

/// Builder for a live query stream.
///
/// - `C` cursor type
/// - `R` raw query result
/// - `T` emitted item
/// - `E` error type
///
/// # Example
///
/// ```no_run
/// use evlog_core::live::StreamQuery;
/// use evlog_core::notifier::{Notifier, NotifierError};
/// # fn notifier() -> Notifier { unimplemented!() }
///
/// # async fn run() {
/// let notifier = notifier();
/// let stream = StreamQuery::new(
///     |after: u64| async move { Ok::<_, NotifierError>(vec![after + 1]) },
///     0,
///     |_, rows: &Vec<u64>| rows.last().copied().unwrap_or_default(),
///     |rows, _| (!rows.is_empty()).then_some(rows),
/// )
/// .spawn(&notifier, "numbers");
/// # drop(stream);
/// # }
/// ```
pub struct StreamQuery<C, R, T, E> {
    query: QueryFn<C, R, E>,
    initial: C,
    advance: AdvanceFn<C, R>,
    transform: TransformFn<C, R, T>,
    buffer: usize,
}

impl<C, R, T, E> StreamQuery<C, R, T, E>
where
    C: Clone + Send + 'static,
    R: Send + 'static,
    T: Send + 'static,
    E: From<NotifierError> + Send + 'static,
{
    /// Describe a live query.
    ///
    /// - `query` runs one read starting after the given cursor
    /// - `advance` computes the next cursor from the previous one and a result
    /// - `transform` maps a result (and the cursor it was read from) to the
    ///   emitted item, or `None` to emit nothing for this result
    pub fn new<Q, Fut, A, X>(mut query: Q, initial: C, advance: A, transform: X) -> Self
    where
        Q: FnMut(C) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        A: FnMut(&C, &R) -> C + Send + 'static,
        X: FnMut(R, &C) -> Option<T> + Send + 'static,
    {
        Self {
            query: Box::new(move |cursor| query(cursor).boxed()),
            initial,
            advance: Box::new(advance),
            transform: Box::new(transform),
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Results buffered ahead of the consumer.
    #[must_use]
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Start the stream, watching `channel` on `notifier` for wakes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(self, notifier: &Notifier, channel: impl Into<String>) -> LiveStream<T, E> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(self.run(notifier.clone(), channel.into(), tx, cancel_rx));
        LiveStream {
            receiver: rx,
            cancel: cancel_tx,
        }
    }

    async fn run(
        mut self,
        notifier: Notifier,
        channel: String,
        tx: mpsc::Sender<Result<T, E>>,
        mut cancel: watch::Receiver<bool>,
    ) {
        // Subscribe before the first read so no write between them is missed.
        let mut subscription = tokio::select! {
            biased;
            () = cancelled(&mut cancel) => return,
            result = notifier.subscribe(channel.as_str()) => match result {
                Ok(subscription) => subscription,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            },
        };

        let mut cursor = self.initial.clone();
        loop {
            let result = (self.query)(cursor.clone()).await;
            if *cancel.borrow() || tx.is_closed() {
                break;
            }

            let batch = match result {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::debug!(channel = %channel, "Live query failed, ending stream");
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            };

            let next = (self.advance)(&cursor, &batch);
            if let Some(item) = (self.transform)(batch, &cursor) {
                tokio::select! {
                    biased;
                    () = cancelled(&mut cancel) => break,
                    sent = tx.send(Ok(item)) => if sent.is_err() { break },
                }
            }
            cursor = next;

            // Wakes that landed during the query or the hand-off.
            if subscription.drain() > 0 {
                continue;
            }
            tokio::select! {
                biased;
                () = cancelled(&mut cancel) => break,
                signal = subscription.recv() => {
                    if signal.is_none() {
                        tracing::warn!(channel = %channel, "Notifier shut down, ending live query");
                        let _ = tx.send(Err(NotifierError::Closed.into())).await;
                        break;
                    }
                    subscription.drain();
                }
            }
        }

        subscription.unsubscribe().await;
        tracing::trace!(channel = %channel, "Live query stopped");
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        // Sender dropped: the stream handle is gone.
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Handle on a running live query.
///
/// Implements [`Stream`]; dropping it cancels the query.
pub struct LiveStream<T, E> {
    receiver: mpsc::Receiver<Result<T, E>>,
    cancel: watch::Sender<bool>,
}

impl<T, E> LiveStream<T, E> {
    /// Stop the stream. Items already buffered can still be read.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether [`LiveStream::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// A stream that yields a single error and ends.
    #[must_use]
    pub fn failed(error: E) -> Self {
        let (tx, receiver) = mpsc::channel(1);
        let _ = tx.try_send(Err(error));
        let (cancel, _) = watch::channel(true);
        Self { receiver, cancel }
    }

    /// Map the emitted items, keeping cancellation attached.
    pub fn map_items<U, F>(self, mut f: F) -> LiveStream<U, E>
    where
        T: Send + 'static,
        U: Send + 'static,
        E: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let Self { mut receiver, cancel } = self;
        let (tx, mapped) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                if tx.send(item.map(&mut f)).await.is_err() {
                    break;
                }
            }
        });
        LiveStream {
            receiver: mapped,
            cancel,
        }
    }
}

impl<T, E> Stream for LiveStream<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl<T, E> std::fmt::Debug for LiveStream<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStream")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
