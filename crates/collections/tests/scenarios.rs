//! End-to-end walkthroughs of the collections over a memory backend.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::TryStreamExt;
use stowage_collections::{
    EventRange, EventStore, ExpectedVersion, MemoryIndex, NewEvent, Queue, TimeSeries,
    TimeSeriesScheduler,
};
use stowage_storage::{
    Entry, ExpectedVersionKind, MemoryBackend, MemoryBackendConfig, StorageBackend, StorageError,
    Store,
    behaviors::{ExpiryDispatcher, IsolationBehavior, TtlBehavior, ValidatingBehavior},
};
use tokio_util::sync::CancellationToken;

fn store() -> Store {
    let backend = MemoryBackend::new();
    Store::builder(backend.clone())
        .layer(Arc::new(IsolationBehavior::local()))
        .layer(Arc::new(ValidatingBehavior::new(Arc::new(backend))))
        .build()
}

fn at(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().expect("valid timestamp")
}

#[tokio::test]
async fn append_with_expected_tail() {
    let queue = Queue::new(store());
    let cancel = CancellationToken::new();

    let first = queue.append("A", Some(Bytes::new()), Some(0), &cancel).await.expect("append");
    assert_eq!(first, Some(0));
    let second = queue.append("A", Some(Bytes::new()), Some(1), &cancel).await.expect("append");
    assert_eq!(second, Some(1));

    let stale = queue.append("A", Some(Bytes::new()), Some(1), &cancel).await.expect("append");
    assert_eq!(stale, None, "the tail has moved past 1");
    assert_eq!(queue.count("A", &cancel).await.expect("count"), 2);
}

#[tokio::test]
async fn take_then_append_checks_against_the_unchanged_tail() {
    let queue = Queue::new(store());
    let cancel = CancellationToken::new();
    queue.append("A", Some(Bytes::new()), Some(0), &cancel).await.expect("append");
    queue.append("A", Some(Bytes::new()), Some(1), &cancel).await.expect("append");

    let taken = queue.try_take_first("A", false, &cancel).await.expect("take");
    assert_eq!(taken.map(|item| item.position), Some(0));
    let state = queue.state("A", &cancel).await.expect("state");
    assert_eq!((state.head, state.tail), (1, 2));

    let position = queue.append("A", Some(Bytes::new()), Some(2), &cancel).await.expect("append");
    assert_eq!(position, Some(2), "append returns the tail it wrote at");
    assert_eq!(queue.count("A", &cancel).await.expect("count"), 2);
}

#[tokio::test]
async fn present_empty_and_absent_elements_stay_distinct() {
    let queue = Queue::new(store());
    let cancel = CancellationToken::new();
    queue.append("A", Some(Bytes::new()), None, &cancel).await.expect("append");
    queue.append("A", None, None, &cancel).await.expect("append");

    let items: Vec<_> = queue.get_all("A", None, &cancel).try_collect().await.expect("scan");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].data, Some(Bytes::new()));
    assert_eq!(items[1].data, None);
}

#[tokio::test]
async fn stale_event_append_is_rejected() {
    let events = EventStore::new(store());
    let cancel = CancellationToken::new();
    let e = |name: &str| NewEvent::new("test", name.to_owned());

    let range = events
        .append("s1", ExpectedVersion::Any, vec![e("e1"), e("e2")], &cancel)
        .await
        .expect("append");
    assert_eq!((range.begin, range.end), (0, 1));

    let range = events
        .append("s1", ExpectedVersion::Exact(1), vec![e("e3")], &cancel)
        .await
        .expect("append");
    assert_eq!((range.begin, range.end), (2, 2));

    let err = events
        .append("s1", ExpectedVersion::Exact(0), vec![e("e4")], &cancel)
        .await
        .expect_err("stale");
    match err {
        StorageError::WrongExpectedVersion { expected, actual, .. } => {
            assert_eq!(expected, ExpectedVersionKind::Exact(0));
            assert_eq!(actual, 2);
        },
        other => panic!("unexpected error: {other:?}"),
    }

    let state = events.state("s1", &cancel).await.expect("state");
    assert_eq!(state.version, 2);
    let recorded: Vec<_> =
        events.get("s1", EventRange::All, &cancel).try_collect().await.expect("read");
    let payloads: Vec<_> = recorded.iter().map(|event| event.data.clone()).collect();
    assert_eq!(payloads, [Bytes::from("e1"), Bytes::from("e2"), Bytes::from("e3")]);
}

#[tokio::test]
async fn point_range_includes_both_bounds() {
    let series = TimeSeries::new(store(), Arc::new(MemoryIndex::new()));
    let t = at(1_700_000_000_000);
    let step = ChronoDuration::milliseconds(1);
    series.add_or_update("id", "before", t - step, Bytes::new()).await.expect("write");
    series.add_or_update("id", "exact", t, Bytes::from("x")).await.expect("write");
    series.add_or_update("id", "after", t + step, Bytes::new()).await.expect("write");

    let hits = series.get_range("id", t, t).await.expect("range");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "exact");
    assert_eq!(hits[0].timestamp, t);
}

#[tokio::test]
async fn ttl_entries_expire_through_a_time_series_scheduler() {
    let scheduler = Arc::new(TimeSeriesScheduler::new(TimeSeries::new(
        Store::builder(MemoryBackend::new()).build(),
        Arc::new(MemoryIndex::new()),
    )));
    let config = MemoryBackendConfig::builder().supports_ttl(false).build().expect("config");
    let backend = MemoryBackend::with_config(config);
    let store = Store::builder(backend.clone())
        .layer(Arc::new(TtlBehavior::new(scheduler.clone())))
        .build();
    let cancel = CancellationToken::new();

    store.set(Entry::new("session", "s").with_expires_in(2), &cancel).await.expect("set");
    store.set(Entry::new("profile", "p"), &cancel).await.expect("set");

    let dispatcher = ExpiryDispatcher::new(store.clone());
    assert_eq!(scheduler.dispatch_due(Utc::now(), &dispatcher).await.expect("dispatch"), 0);
    assert!(backend.get("session").await.expect("get").is_some());

    let later = Utc::now() + ChronoDuration::seconds(5);
    assert_eq!(scheduler.dispatch_due(later, &dispatcher).await.expect("dispatch"), 1);
    assert!(backend.get("session").await.expect("get").is_none(), "expired key is deleted");
    assert!(backend.get("profile").await.expect("get").is_some());
    assert!(scheduler.get_all(at(0), later).await.expect("pending").is_empty());
}

#[tokio::test]
async fn rewritten_value_survives_its_predecessors_expiry() {
    let scheduler = Arc::new(TimeSeriesScheduler::new(TimeSeries::new(
        Store::builder(MemoryBackend::new()).build(),
        Arc::new(MemoryIndex::new()),
    )));
    let backend = MemoryBackend::new();
    let store = Store::builder(backend.clone())
        .layer(Arc::new(TtlBehavior::new(scheduler.clone())))
        .build();
    let cancel = CancellationToken::new();

    store.set(Entry::new("k", "old").with_expires_in(1), &cancel).await.expect("set");
    let pending = scheduler.get_all(at(0), Utc::now() + ChronoDuration::hours(1)).await;
    let notice = pending.expect("pending").pop().expect("one expiry scheduled");

    // A plain rewrite cancels the expiry; deliver the stale notice by hand.
    store.set(Entry::new("k", "new"), &cancel).await.expect("set");
    let dispatcher = ExpiryDispatcher::new(store.clone());
    stowage_storage::Dispatch::dispatch(&dispatcher, &notice.id, notice.payload)
        .await
        .expect("dispatch");

    let entry = store.get("k", &cancel).await.expect("get").expect("still present");
    assert_eq!(entry.value, Some(Bytes::from("new")));
}
