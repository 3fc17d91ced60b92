//! Combinators over streams of batches.
//!
//! Live reads emit pages (batches) of events rather than single events. These
//! adapters apply per-item logic while keeping the batch boundaries, so a
//! consumer can still treat one page as one unit of work.

use futures::Stream;
use futures::StreamExt;
use std::future::ready;

/// Per-item adapters for any `Stream<Item = Vec<T>>`.
pub trait BatchStreamExt<T>: Stream<Item = Vec<T>> + Sized {
    /// Map every item. `f` receives the item and its index across the whole
    /// stream (not within its batch).
    fn batched_map<U, F>(self, mut f: F) -> impl Stream<Item = Vec<U>>
    where
        F: FnMut(T, usize) -> U,
    {
        let mut index = 0;
        self.map(move |batch| {
            batch
                .into_iter()
                .map(|item| {
                    let mapped = f(item, index);
                    index += 1;
                    mapped
                })
                .collect()
        })
    }

    /// Skip the first `count` items overall. Batches emptied by the skip are
    /// dropped; the rest keep their boundaries.
    fn batched_skip(self, count: usize) -> impl Stream<Item = Vec<T>> {
        let mut remaining = count;
        self.map(move |mut batch| {
            let skip = remaining.min(batch.len());
            remaining -= skip;
            batch.drain(..skip);
            batch
        })
        .filter(|batch| ready(!batch.is_empty()))
    }

    /// Fold items into an accumulator, emitting its value once per batch.
    ///
    /// `f` receives the accumulator, the item and its index across the stream.
    fn batched_scan<A, F>(self, seed: A, mut f: F) -> impl Stream<Item = A>
    where
        A: Clone,
        F: FnMut(A, T, usize) -> A,
    {
        let mut index = 0;
        self.scan(seed, move |acc, batch| {
            let mut current = acc.clone();
            for item in batch {
                current = f(current, item, index);
                index += 1;
            }
            acc.clone_from(&current);
            ready(Some(current))
        })
    }

    /// Flatten batches into individual items.
    fn unwrap_batches(self) -> impl Stream<Item = T> {
        self.flat_map(futures::stream::iter)
    }
}

impl<T, S> BatchStreamExt<T> for S where S: Stream<Item = Vec<T>> + Sized {}
