//! Event log contract tests, run against the in-memory log.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use evlog_core::environment::Clock;
use evlog_core::event::{IncludeMetadata, InsertMetadata, MetadataField};
use evlog_core::event_store::{EventLog, EventStoreError, Page, QueryOptions};
use evlog_core::filter::Filters;
use evlog_core::live::{LiveStream, StreamQuery};
use evlog_core::stream::{Cursor, StreamKey};
use evlog_testing::{InMemoryEventLog, init_test_tracing, test_clock};
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;

async fn next_page(live: &mut LiveStream<Page, EventStoreError>) -> Page {
    tokio::time::timeout(Duration::from_secs(5), live.next())
        .await
        .expect("no page within 5s")
        .expect("stream ended")
        .expect("query failed")
}

#[tokio::test]
async fn test_insert_then_query_round_trip() {
    init_test_tracing();
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");

    let cursors = log
        .insert_events(
            key.clone(),
            vec![json!({"text": "a"}), json!({"text": "b"}), json!({"text": "c"})],
            InsertMetadata::new(),
        )
        .await
        .unwrap();
    assert_eq!(cursors.len(), 3);
    assert!(cursors.windows(2).all(|pair| pair[0] < pair[1]));

    let page = log.query(key, QueryOptions::new()).await.unwrap();
    assert_eq!(
        page.values(),
        vec![json!({"text": "a"}), json!({"text": "b"}), json!({"text": "c"})]
    );
    assert_eq!(page.cursor, Some(cursors[2]));
}

#[tokio::test]
async fn test_empty_insert_is_a_no_op() {
    let log = InMemoryEventLog::new();
    let cursors = log
        .insert_events(StreamKey::new("chat"), Vec::new(), InsertMetadata::new())
        .await
        .unwrap();
    assert!(cursors.is_empty());
    assert!(log.events(&StreamKey::new("chat")).is_empty());
}

#[tokio::test]
async fn test_cursor_resumes_after_last_read() {
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");

    let empty = log
        .query(key.clone(), QueryOptions::new().tracking_cursor(None))
        .await
        .unwrap();
    assert!(empty.is_empty());
    assert_eq!(empty.cursor, None);

    let first = log
        .insert_event(key.clone(), json!("one"), InsertMetadata::new())
        .await
        .unwrap();
    let page = log
        .query(key.clone(), QueryOptions::new().tracking_cursor(None))
        .await
        .unwrap();
    assert_eq!(page.cursor, Some(first));

    let second = log
        .insert_event(key.clone(), json!("two"), InsertMetadata::new())
        .await
        .unwrap();
    let page = log
        .query(key.clone(), QueryOptions::new().tracking_cursor(page.cursor))
        .await
        .unwrap();
    assert_eq!(page.values(), vec![json!("two")]);
    assert_eq!(page.cursor, Some(second));
    assert!(second > first);

    // Nothing new: the cursor stays put.
    let page = log
        .query(key, QueryOptions::new().tracking_cursor(Some(second)))
        .await
        .unwrap();
    assert!(page.is_empty());
    assert_eq!(page.cursor, Some(second));
}

#[tokio::test]
async fn test_filters_match_metadata_attributes() {
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");

    log.insert_event(key.clone(), json!("from s1"), InsertMetadata::new().with_session_id("s1"))
        .await
        .unwrap();
    log.insert_event(key.clone(), json!("from s2"), InsertMetadata::new().with_session_id("s2"))
        .await
        .unwrap();
    log.insert_event(key.clone(), json!("anonymous"), InsertMetadata::new())
        .await
        .unwrap();

    let page = log
        .query(
            key.clone(),
            QueryOptions::new().with_filters(Filters::new().eq("sessionId", "s2")),
        )
        .await
        .unwrap();
    assert_eq!(page.values(), vec![json!("from s2")]);

    let page = log
        .query(
            key.clone(),
            QueryOptions::new().with_filters(Filters::new().one_of("sessionId", ["s1", "s2"])),
        )
        .await
        .unwrap();
    assert_eq!(page.values(), vec![json!("from s1"), json!("from s2")]);

    let page = log
        .query(
            key,
            QueryOptions::new()
                .with_filters(Filters::from_json(&json!({"processId": "test-process"})).unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(page.events.len(), 3);
}

#[tokio::test]
async fn test_filtered_cursor_stops_at_last_match() {
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");
    let only_s2 = Filters::new().eq("sessionId", "s2");

    log.insert_event(key.clone(), json!("a"), InsertMetadata::new().with_session_id("s1"))
        .await
        .unwrap();
    let matched = log
        .insert_event(key.clone(), json!("b"), InsertMetadata::new().with_session_id("s2"))
        .await
        .unwrap();
    log.insert_event(key.clone(), json!("c"), InsertMetadata::new().with_session_id("s1"))
        .await
        .unwrap();

    let page = log
        .query(
            key.clone(),
            QueryOptions::new().with_filters(only_s2.clone()).tracking_cursor(None),
        )
        .await
        .unwrap();
    assert_eq!(page.values(), vec![json!("b")]);
    assert_eq!(page.cursor, Some(matched));

    let rest = log
        .query(key, QueryOptions::new().with_filters(only_s2).tracking_cursor(page.cursor))
        .await
        .unwrap();
    assert!(rest.is_empty());
    assert_eq!(rest.cursor, Some(matched));
}

#[tokio::test]
async fn test_metadata_subset() {
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");
    let cursor = log
        .insert_event(
            key.clone(),
            json!("hi"),
            InsertMetadata::new()
                .with_session_id("s1")
                .with_ip_address("10.0.0.1")
                .with_actor(json!({"sub": "u1", "iat": 99})),
        )
        .await
        .unwrap();

    let bare = log.query(key.clone(), QueryOptions::new()).await.unwrap();
    assert_eq!(bare.events[0].id, None);
    assert_eq!(bare.events[0].session_id, None);

    let subset = log
        .query(
            key.clone(),
            QueryOptions::new().with_metadata(IncludeMetadata::Fields(vec![
                MetadataField::Id,
                MetadataField::SessionId,
            ])),
        )
        .await
        .unwrap();
    let event = &subset.events[0];
    assert_eq!(event.id, Some(cursor));
    assert_eq!(event.session_id.as_deref(), Some("s1"));
    assert_eq!(event.ip_address, None);
    assert_eq!(event.timestamp, None);

    let all = log
        .query(key, QueryOptions::new().with_metadata(IncludeMetadata::All))
        .await
        .unwrap();
    let event = &all.events[0];
    assert_eq!(event.timestamp, Some(test_clock().now()));
    assert_eq!(event.process_id.as_deref(), Some("test-process"));
    assert_eq!(event.actor, Some(json!({"sub": "u1"})));
}

#[tokio::test]
async fn test_observable_emits_new_writes() {
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");
    log.insert_event(key.clone(), json!("before"), InsertMetadata::new())
        .await
        .unwrap();

    let mut live = log.observable(key.clone(), QueryOptions::new().tracking_cursor(None));
    let initial = next_page(&mut live).await;
    assert_eq!(initial.values(), vec![json!("before")]);

    let cursor = log
        .insert_event(key.clone(), json!("after"), InsertMetadata::new())
        .await
        .unwrap();
    let page = next_page(&mut live).await;
    assert_eq!(page.values(), vec![json!("after")]);
    assert_eq!(page.cursor, Some(cursor));
}

#[tokio::test]
async fn test_observable_without_tracking_skips_empty_pages() {
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");

    let mut live = log.observable(key.clone(), QueryOptions::new());
    log.insert_event(key, json!("first"), InsertMetadata::new())
        .await
        .unwrap();

    // Whether the write landed before or after the initial read, the first
    // page seen carries it.
    let page = next_page(&mut live).await;
    assert_eq!(page.values(), vec![json!("first")]);
}

#[tokio::test]
async fn test_woken_query_sees_the_insert() {
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");

    let reader = log.clone();
    let query_key = key.clone();
    let mut live = StreamQuery::new(
        move |after: Option<Cursor>| {
            let reader = reader.clone();
            let key = query_key.clone();
            async move { reader.query(key, QueryOptions::new().tracking_cursor(after)).await }
        },
        None,
        |after, page: &Page| page.cursor.or(*after),
        |page, _| Some(page),
    )
    .spawn(log.notifier(), key.as_str());

    let initial = next_page(&mut live).await;
    assert!(initial.is_empty());

    for n in 1..=5 {
        log.insert_event(key.clone(), json!(n), InsertMetadata::new())
            .await
            .unwrap();
        let page = next_page(&mut live).await;
        assert!(page.values().contains(&json!(n)), "page {n} missed its insert");
    }
}

#[tokio::test]
async fn test_wakes_during_a_query_coalesce() {
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");

    let mut live = log.observable(key.clone(), QueryOptions::new().tracking_cursor(None));
    let initial = next_page(&mut live).await;
    assert!(initial.is_empty());
    assert_eq!(log.query_calls(), 1);

    log.pause_queries();
    log.insert_event(key.clone(), json!(1), InsertMetadata::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.query_calls(), 2, "the first wake starts a query");

    log.insert_events(key, vec![json!(2), json!(3), json!(4)], InsertMetadata::new())
        .await
        .unwrap();
    log.insert_event(StreamKey::new("chat"), json!(5), InsertMetadata::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.query_calls(), 2, "wakes wait for the running query");

    log.resume_queries();
    let page = next_page(&mut live).await;
    assert_eq!(page.values(), vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);

    // Every wake that arrived meanwhile collapses into one follow-up read.
    let follow_up = next_page(&mut live).await;
    assert!(follow_up.is_empty());
    assert_eq!(follow_up.cursor, page.cursor);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.query_calls(), 3);
}

#[tokio::test]
async fn test_query_error_ends_observable() {
    let log = InMemoryEventLog::new();
    log.fail_queries(true);

    let mut live = log.observable(StreamKey::new("chat"), QueryOptions::new().tracking_cursor(None));
    let first = tokio::time::timeout(Duration::from_secs(5), live.next())
        .await
        .expect("no item within 5s");
    assert!(matches!(first, Some(Err(EventStoreError::DatabaseError(_)))));

    let after = tokio::time::timeout(Duration::from_secs(5), live.next())
        .await
        .expect("stream did not end");
    assert!(after.is_none());
}

#[tokio::test]
async fn test_dropping_observable_releases_channel() {
    let log = InMemoryEventLog::new();
    let key = StreamKey::new("chat");

    let mut first = log.observable(key.clone(), QueryOptions::new().tracking_cursor(None));
    let mut second = log.observable(key.clone(), QueryOptions::new().tracking_cursor(None));
    next_page(&mut first).await;
    next_page(&mut second).await;
    assert_eq!(log.pubsub_stats().subscribe_calls(), 1);
    assert_eq!(log.notifier().subscriber_count(key.as_str()), 2);

    drop(first);
    drop(second);
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.pubsub_stats().unsubscribe_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("channel never released");

    assert_eq!(log.pubsub_stats().unsubscribe_calls(), 1);
    assert_eq!(log.notifier().subscriber_count(key.as_str()), 0);
}

#[tokio::test]
async fn test_cursor_ordering_is_total() {
    let log = InMemoryEventLog::new();
    let a = log
        .insert_event(StreamKey::new("a"), json!(1), InsertMetadata::new())
        .await
        .unwrap();
    let b = log
        .insert_event(StreamKey::new("b"), json!(2), InsertMetadata::new())
        .await
        .unwrap();
    assert!(Cursor::new(0) < a);
    assert!(a < b);
}
