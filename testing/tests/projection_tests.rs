//! Projection engine tests against the in-memory backends.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use evlog_core::event::InsertMetadata;
use evlog_core::event_store::EventLog;
use evlog_core::stream::{Cursor, StreamKey};
use evlog_projections::{
    Batch, Operation, ProjectionEngine, ProjectionError, ProjectionLog, event_log_source,
};
use evlog_testing::{InMemoryEventLog, InMemoryProjectionBackend, init_test_tracing};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn set(members: &[&str]) -> BTreeSet<String> {
    members.iter().map(ToString::to_string).collect()
}

fn hello_world_batches() -> Vec<Batch> {
    vec![
        Batch::new(
            Cursor::new(1),
            vec![Operation::set_add("greetings", ["hello", "world", "universe"])],
        ),
        Batch::new(Cursor::new(2), vec![Operation::set_remove("greetings", ["universe"])]),
    ]
}

/// A replayable source over a fixed list of batches that stays open afterwards.
fn replayable(
    batches: Vec<Batch>,
) -> impl Fn(Option<Cursor>) -> BoxStream<'static, evlog_projections::Result<Value>> + Send + Sync + 'static
{
    move |after: Option<Cursor>| {
        let items: Vec<evlog_projections::Result<Value>> = batches
            .iter()
            .filter(|batch| Some(batch.cursor) > after)
            .map(|batch| Ok(batch.to_json()))
            .collect();
        stream::iter(items).chain(stream::pending()).boxed()
    }
}

/// Batches sent on the channel. Only the first subscription receives them;
/// resubscribes see an empty tail.
fn live_source(
    live_rx: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Value>>>>,
) -> BoxStream<'static, evlog_projections::Result<Value>> {
    stream::once(async move {
        let receiver = live_rx.lock().await.take();
        receiver
    })
    .flat_map(|receiver| match receiver {
        Some(mut receiver) => stream::poll_fn(move |cx| receiver.poll_recv(cx))
            .map(Ok::<Value, ProjectionError>)
            .boxed(),
        None => stream::pending().boxed(),
    })
    .boxed()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

#[tokio::test]
async fn test_projection_converges() {
    init_test_tracing();
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    let engine = ProjectionEngine::new(backend.clone(), log.notifier().clone());

    let handle = engine.run("greetings", replayable(hello_world_batches()));
    wait_until(|| backend.cursor_now("greetings") == Some(Cursor::new(2))).await;

    assert_eq!(backend.members_now("greetings"), set(&["hello", "world"]));
    handle.join().await;

    let status = backend.pool_status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.acquired, status.released);
}

#[tokio::test]
async fn test_members_stream_follows_commits() {
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    let engine = ProjectionEngine::new(backend.clone(), log.notifier().clone());

    let mut members = engine.members("greetings");
    let initial = members.next().await.expect("stream ended").expect("read failed");
    assert!(initial.is_empty());

    let handle = engine.run("greetings", replayable(hello_world_batches()));

    let converged = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(update) = members.next().await {
            if update.expect("read failed") == set(&["hello", "world"]) {
                return true;
            }
        }
        false
    })
    .await
    .expect("members never converged");
    assert!(converged);
    handle.join().await;
}

#[tokio::test]
async fn test_restart_resumes_from_durable_cursor() {
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    let engine = ProjectionEngine::new(backend.clone(), log.notifier().clone());

    let first = engine.run("greetings", replayable(hello_world_batches()));
    wait_until(|| backend.cursor_now("greetings") == Some(Cursor::new(2))).await;
    first.join().await;
    let commits = backend.commit_count();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let batches = hello_world_batches();
    let source = move |after: Option<Cursor>| {
        recorded.lock().unwrap().push(after);
        replayable(batches.clone())(after)
    };

    let second = engine.run("greetings", source);
    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    second.join().await;

    assert_eq!(*seen.lock().unwrap(), vec![Some(Cursor::new(2))]);
    assert_eq!(backend.commit_count(), commits);
}

#[tokio::test]
async fn test_two_runners_converge_despite_conflicts() {
    init_test_tracing();
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    backend.set_commit_delay(Some(Duration::from_millis(20)));

    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let engine =
        ProjectionEngine::new(backend.clone(), log.notifier().clone()).with_log_sink(sink_tx);

    let batches = hello_world_batches();
    let a = engine.run("greetings", replayable(batches.clone()));
    let b = engine.run("greetings", replayable(batches));

    wait_until(|| backend.cursor_now("greetings") == Some(Cursor::new(2))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(backend.members_now("greetings"), set(&["hello", "world"]));

    a.join().await;
    b.join().await;

    let mut conflicts = 0;
    while let Ok(entry) = sink_rx.try_recv() {
        if matches!(entry, ProjectionLog::Conflict { .. }) {
            conflicts += 1;
        }
    }
    assert!(conflicts >= 1, "the losing runner should report a conflict");

    let status = backend.pool_status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.acquired, status.released);
}

#[tokio::test]
async fn test_external_cursor_move_triggers_resubscribe() {
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let engine =
        ProjectionEngine::new(backend.clone(), log.notifier().clone()).with_log_sink(sink_tx);

    let (live_tx, live_rx) = mpsc::unbounded_channel::<Value>();
    let live_rx = Arc::new(tokio::sync::Mutex::new(Some(live_rx)));
    let source = move |_after: Option<Cursor>| {
        let live_rx = Arc::clone(&live_rx);
        live_source(live_rx)
    };

    let handle = engine.run("p", source);
    live_tx
        .send(Batch::new(Cursor::new(1), vec![Operation::set_add("s", ["a"])]).to_json())
        .unwrap();
    wait_until(|| backend.cursor_now("p") == Some(Cursor::new(1))).await;

    // Someone else advances the cursor; our next commit must notice.
    backend.overwrite_cursor("p", Cursor::new(10));
    live_tx
        .send(Batch::new(Cursor::new(2), vec![Operation::set_add("s", ["b"])]).to_json())
        .unwrap();

    let mut saw_conflict = false;
    let mut resubscribed_at = None;
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(entry) = sink_rx.recv().await {
            match entry {
                ProjectionLog::Conflict { expected } => {
                    assert_eq!(expected, Some(Cursor::new(1)));
                    saw_conflict = true;
                }
                ProjectionLog::Subscribed { cursor } if saw_conflict => {
                    resubscribed_at = cursor;
                    break;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("no resubscribe within 5s");

    assert!(saw_conflict);
    assert_eq!(resubscribed_at, Some(Cursor::new(10)));
    assert_eq!(backend.members_now("s"), set(&["a"]));
    handle.join().await;
}

#[tokio::test]
async fn test_malformed_batches_are_dropped() {
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let engine =
        ProjectionEngine::new(backend.clone(), log.notifier().clone()).with_log_sink(sink_tx);

    let source = |_after: Option<Cursor>| {
        let items: Vec<evlog_projections::Result<Value>> = vec![
            Ok(json!({"operations": [["sadd", "s", "lost"]]})),
            Ok(json!({"cursor": 1, "operations": "sadd"})),
            Ok(json!({"cursor": 2, "operations": [["sadd", "s", "kept"], ["explode", "s"]]})),
        ];
        stream::iter(items).chain(stream::pending())
        .boxed()
    };

    let handle = engine.run("p", source);
    wait_until(|| backend.cursor_now("p") == Some(Cursor::new(2))).await;
    assert_eq!(backend.members_now("s"), set(&["kept"]));
    handle.join().await;

    let mut dropped = 0;
    while let Ok(entry) = sink_rx.try_recv() {
        if matches!(entry, ProjectionLog::BatchDropped { .. }) {
            dropped += 1;
        }
    }
    assert_eq!(dropped, 2);
}

#[tokio::test]
async fn test_failed_transaction_keeps_queue_until_next_batch() {
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    backend.fail_next_commits(1);
    let engine = ProjectionEngine::new(backend.clone(), log.notifier().clone());

    let (live_tx, live_rx) = mpsc::unbounded_channel::<Value>();
    let live_rx = Arc::new(tokio::sync::Mutex::new(Some(live_rx)));
    let handle = engine.run("p", move |_after: Option<Cursor>| live_source(Arc::clone(&live_rx)));

    live_tx
        .send(Batch::new(Cursor::new(1), vec![Operation::set_add("s", ["first"])]).to_json())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.cursor_now("p"), None);
    assert!(backend.members_now("s").is_empty());

    live_tx
        .send(Batch::new(Cursor::new(2), vec![Operation::set_add("s", ["second"])]).to_json())
        .unwrap();
    wait_until(|| backend.cursor_now("p") == Some(Cursor::new(2))).await;
    assert_eq!(backend.members_now("s"), set(&["first", "second"]));
    assert_eq!(backend.commit_count(), 1);

    handle.join().await;
    assert_eq!(backend.pool_status().in_use, 0);
}

#[tokio::test]
async fn test_stop_skips_wakes_of_in_flight_transaction() {
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    backend.set_commit_delay(Some(Duration::from_millis(100)));
    let engine = ProjectionEngine::new(backend.clone(), log.notifier().clone());

    let publishes_before = log.pubsub_stats().publish_calls();
    let handle = engine.run("greetings", replayable(hello_world_batches()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.join().await;

    // The transaction started before the stop still landed...
    assert_eq!(backend.cursor_now("greetings"), Some(Cursor::new(1)));
    // ...but nobody was woken for it.
    assert_eq!(log.pubsub_stats().publish_calls(), publishes_before);
    assert_eq!(backend.pool_status().in_use, 0);
}

#[tokio::test]
async fn test_source_error_ends_projection() {
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let engine =
        ProjectionEngine::new(backend.clone(), log.notifier().clone()).with_log_sink(sink_tx);

    let handle = engine.run("p", |_after: Option<Cursor>| {
        let items: Vec<evlog_projections::Result<Value>> =
            vec![Err(ProjectionError::EventProcessing("boom".to_string()))];
        stream::iter(items).boxed()
    });
    tokio::time::timeout(Duration::from_secs(5), handle.finished())
        .await
        .expect("projection did not end");

    let mut entries = Vec::new();
    while let Ok(entry) = sink_rx.try_recv() {
        entries.push(entry);
    }
    assert!(entries.iter().any(|e| matches!(e, ProjectionLog::Failed { .. })));
    assert_eq!(entries.last(), Some(&ProjectionLog::Stopped));
}

#[tokio::test]
async fn test_commit_with_lost_reply_is_not_reapplied() {
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    backend.lose_next_commit_replies(1);
    let engine = ProjectionEngine::new(backend.clone(), log.notifier().clone());
    let key = StreamKey::new("audit");

    let handle = engine.run("history", event_log_source(log.clone(), key.clone()));

    let first = log
        .insert_event(key.clone(), json!({"operations": [["rpush", "history", "a"]]}), InsertMetadata::new())
        .await
        .unwrap();
    wait_until(|| backend.cursor_now("history") == Some(first)).await;
    assert_eq!(backend.list_now("history"), vec!["a"]);

    // The next batch finds the cursor already moved and replays from it.
    let second = log
        .insert_event(key, json!({"operations": [["rpush", "history", "b"]]}), InsertMetadata::new())
        .await
        .unwrap();
    wait_until(|| backend.cursor_now("history") == Some(second)).await;
    assert_eq!(backend.list_now("history"), vec!["a", "b"]);

    handle.join().await;
    assert_eq!(backend.pool_status().in_use, 0);
}

#[tokio::test]
async fn test_event_log_source_feeds_projection() {
    let log = InMemoryEventLog::new();
    let backend = InMemoryProjectionBackend::new();
    let engine = ProjectionEngine::new(backend.clone(), log.notifier().clone());
    let key = StreamKey::new("presence");

    log.insert_event(
        key.clone(),
        json!({"operations": [["sadd", "online", "alice", "bob"]]}),
        InsertMetadata::new(),
    )
    .await
    .unwrap();

    let handle = engine.run("online", event_log_source(log.clone(), key.clone()));
    wait_until(|| backend.members_now("online") == set(&["alice", "bob"])).await;

    let last = log
        .insert_event(
            key,
            json!({"operations": [["srem", "online", "bob"]]}),
            InsertMetadata::new(),
        )
        .await
        .unwrap();
    wait_until(|| backend.cursor_now("online") == Some(last)).await;
    assert_eq!(backend.members_now("online"), set(&["alice"]));

    handle.join().await;
}
