//! Concurrent access tests for stores built with per-key isolation.
//!
//! These tests exercise the behavior stack under multi-threaded workloads to
//! detect lost updates, deadlocks and cross-key blocking.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use stowage_storage::{
    Entry, MemoryBackend, MemoryBackendConfig, Store,
    behaviors::{
        CacheBehavior, CacheConfig, EtagBehavior, IsolationBehavior, LocalExecutor,
        ValidatingBehavior,
    },
    testutil::make_key,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Number of concurrent tasks for most tests.
const CONCURRENCY: usize = 16;

/// Number of increments each task performs.
const OPS_PER_TASK: usize = 25;

fn emulated_etag_store() -> (Store, Arc<LocalExecutor>) {
    let config = MemoryBackendConfig::builder().supports_etag(false).build().expect("config");
    let backend = MemoryBackend::with_config(config);
    let shared = Arc::new(backend.clone());
    let executor = Arc::new(LocalExecutor::new());
    let store = Store::builder(backend)
        .layer(Arc::new(EtagBehavior::new(shared.clone())))
        .layer(Arc::new(CacheBehavior::new(CacheConfig::default())))
        .layer(Arc::new(IsolationBehavior::new(Arc::clone(&executor))))
        .layer(Arc::new(ValidatingBehavior::new(shared)))
        .build();
    (store, executor)
}

async fn increment(store: &Store, key: &str) -> usize {
    let cancel = CancellationToken::new();
    let mut conflicts = 0;
    loop {
        let current = store.get(key, &cancel).await.expect("get");
        let (value, etag) = match current {
            Some(entry) => {
                let value = entry.value.expect("counter is never null");
                let value: u64 = std::str::from_utf8(&value).expect("utf8").parse().expect("u64");
                (value, entry.etag)
            },
            None => (0, String::new()),
        };
        let next = Entry::new(key, (value + 1).to_string()).with_etag(etag);
        if store.set(next, &cancel).await.expect("set").is_some() {
            return conflicts;
        }
        conflicts += 1;
    }
}

/// Optimistic read-modify-write loops on one key never lose an update, even
/// when the backend has no native conditional writes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn optimistic_increments_never_lose_updates() {
    let (store, executor) = emulated_etag_store();
    // Seed the key so every writer starts from a conditional write.
    store.set(Entry::new("counter", "0"), &CancellationToken::new()).await.expect("seed");

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let store = store.clone();
        set.spawn(async move {
            let mut conflicts = 0;
            for _ in 0..OPS_PER_TASK {
                conflicts += increment(&store, "counter").await;
            }
            conflicts
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task join");
    }

    let entry = store.get("counter", &CancellationToken::new()).await.expect("get").expect("set");
    assert_eq!(entry.value, Some(Bytes::from((CONCURRENCY * OPS_PER_TASK).to_string())));
    assert_eq!(executor.active_lanes(), 0, "idle lanes are evicted");
}

/// Writers to distinct keys all land and none blocks another.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_writers_distinct_keys() {
    let (store, _) = emulated_etag_store();
    let mut set = JoinSet::new();
    for task in 0..CONCURRENCY {
        let store = store.clone();
        set.spawn(async move {
            for i in 0..OPS_PER_TASK {
                let key = make_key(&format!("t{task}"), i);
                store.set(Entry::new(key, "v"), &CancellationToken::new()).await.expect("set");
            }
        });
    }
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(result) = set.join_next().await {
            result.expect("task join");
        }
    })
    .await
    .expect("no deadlock");

    for task in 0..CONCURRENCY {
        for i in 0..OPS_PER_TASK {
            let key = make_key(&format!("t{task}"), i);
            assert!(store.get(&key, &CancellationToken::new()).await.expect("get").is_some());
        }
    }
}

/// Cancelled callers leave no lane behind and do not disturb other callers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_callers_release_their_lanes() {
    let (store, executor) = emulated_etag_store();
    let mut set = JoinSet::new();
    for i in 0..CONCURRENCY {
        let store = store.clone();
        set.spawn(async move {
            let cancel = CancellationToken::new();
            if i % 2 == 0 {
                cancel.cancel();
            }
            store.set(Entry::new("shared", i.to_string()), &cancel).await
        });
    }

    let mut cancelled = 0;
    while let Some(result) = set.join_next().await {
        match result.expect("task join") {
            Ok(etag) => assert!(etag.is_some()),
            Err(err) if err.is_cancelled() => cancelled += 1,
            Err(err) => panic!("unexpected error: {err:?}"),
        }
    }
    assert_eq!(cancelled, CONCURRENCY / 2);
    assert_eq!(executor.active_lanes(), 0);
}
