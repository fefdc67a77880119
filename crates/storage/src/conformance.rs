//! Conformance test suite for [`StorageBackend`] implementations.
//!
//! This module provides async check functions that validate whether a
//! [`StorageBackend`] satisfies the primitive contract. Raw backends and
//! fully layered [`Store`](crate::Store)s, which implement the contract
//! themselves, run the same suite.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call each conformance function with
//! a fresh backend instance:
//!
//! ```no_run
//! use stowage_storage::{MemoryBackend, conformance};
//!
//! #[tokio::test]
//! async fn crud_get_returns_none_for_missing_key() {
//!     conformance::crud_get_returns_none_for_missing_key(&MemoryBackend::new()).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Functions | Contract aspect |
//! |----------|-----------|-----------------|
//! | CRUD | 7 checks | set/get/delete semantics, null vs empty |
//! | ETag | 5 checks | token freshness, stale rejection, conditional delete |
//! | TTL | 3 checks | expiry, no-expiry, overwrite clears expiry |
//! | Concurrent | 2 checks | parallel writers, single winner per etag |
//! | Features | 1 check | capability descriptor sanity |

use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{backend::StorageBackend, types::Entry};

// ============================================================================
// CRUD — set/get/delete semantics (7 checks)
// ============================================================================

/// `get` on a nonexistent key returns `Ok(None)`.
pub async fn crud_get_returns_none_for_missing_key<B: StorageBackend>(backend: &B) {
    let result = backend.get("nonexistent").await;
    assert!(result.is_ok(), "get should not error on missing key: {result:?}");
    assert_eq!(result.expect("checked above"), None, "missing key should return None");
}

/// `set` then `get` round-trips the value.
pub async fn crud_set_then_get_returns_value<B: StorageBackend>(backend: &B) {
    backend.set(Entry::new("k1", "v1")).await.expect("set should succeed");
    let entry = backend.get("k1").await.expect("get should succeed").expect("present");
    assert_eq!(entry.key, "k1");
    assert_eq!(entry.value, Some(Bytes::from("v1")));
}

/// `set` on an existing key overwrites the value.
pub async fn crud_set_overwrites_existing<B: StorageBackend>(backend: &B) {
    backend.set(Entry::new("k1", "original")).await.expect("set");
    backend.set(Entry::new("k1", "updated")).await.expect("overwrite");
    let entry = backend.get("k1").await.expect("get").expect("present");
    assert_eq!(entry.value, Some(Bytes::from("updated")));
}

/// A stored null, a stored empty value and a missing key are distinguishable.
pub async fn crud_null_empty_and_missing_are_distinct<B: StorageBackend>(backend: &B) {
    backend.set(Entry::null("null")).await.expect("set null");
    backend.set(Entry::new("empty", Bytes::new())).await.expect("set empty");

    let null = backend.get("null").await.expect("get null").expect("null is stored");
    let empty = backend.get("empty").await.expect("get empty").expect("empty is stored");
    assert_eq!(null.value, None);
    assert_eq!(empty.value, Some(Bytes::new()));
    assert_eq!(backend.get("missing").await.expect("get missing"), None);
}

/// `delete` on a nonexistent key returns `false`.
pub async fn crud_delete_nonexistent_returns_false<B: StorageBackend>(backend: &B) {
    let removed = backend.delete("ghost", "").await.expect("delete of missing key must not error");
    assert!(!removed, "nothing should have been removed");
}

/// Unconditional `delete` removes a previously-set key.
pub async fn crud_delete_removes_key<B: StorageBackend>(backend: &B) {
    backend.set(Entry::new("k2", "val")).await.expect("set");
    assert!(backend.delete("k2", "").await.expect("delete"));
    assert_eq!(backend.get("k2").await.expect("get after delete"), None);
}

/// Large values (256 KiB) round-trip correctly.
pub async fn crud_large_value_roundtrip<B: StorageBackend>(backend: &B) {
    let big = Bytes::from(vec![0xCDu8; 256 * 1024]);
    backend.set(Entry::new("big", big.clone())).await.expect("set large value");
    let entry = backend.get("big").await.expect("get large value").expect("present");
    assert_eq!(entry.value_len(), big.len(), "large value length mismatch");
    assert_eq!(entry.value, Some(big));
}

// ============================================================================
// ETag — optimistic concurrency (5 checks)
// ============================================================================

/// The etag returned by `set` is the one reported by `get`.
pub async fn etag_set_matches_get<B: StorageBackend>(backend: &B) {
    let etag = backend.set(Entry::new("e1", "v")).await.expect("set").expect("accepted");
    assert!(!etag.is_empty(), "etag must not be empty");
    let entry = backend.get("e1").await.expect("get").expect("present");
    assert_eq!(entry.etag, etag);
}

/// Every accepted write mints a new etag.
pub async fn etag_changes_on_every_write<B: StorageBackend>(backend: &B) {
    let first = backend.set(Entry::new("e2", "a")).await.expect("set").expect("accepted");
    let second = backend
        .set(Entry::new("e2", "b").with_etag(first.clone()))
        .await
        .expect("set")
        .expect("current etag accepted");
    assert_ne!(first, second);
}

/// A write carrying a superseded etag is rejected and changes nothing.
pub async fn etag_stale_write_is_rejected<B: StorageBackend>(backend: &B) {
    let first = backend.set(Entry::new("e3", "a")).await.expect("set").expect("accepted");
    backend.set(Entry::new("e3", "b")).await.expect("set").expect("accepted");

    let rejected = backend.set(Entry::new("e3", "c").with_etag(first)).await.expect("set");
    assert_eq!(rejected, None, "stale etag must be rejected");
    let entry = backend.get("e3").await.expect("get").expect("present");
    assert_eq!(entry.value, Some(Bytes::from("b")));
}

/// A conditional write to a missing key is rejected.
pub async fn etag_conditional_write_to_missing_key_is_rejected<B: StorageBackend>(backend: &B) {
    let rejected = backend.set(Entry::new("e4", "v").with_etag("ghost")).await.expect("set");
    assert_eq!(rejected, None);
    assert_eq!(backend.get("e4").await.expect("get"), None);
}

/// `delete` honors its etag precondition.
pub async fn etag_conditional_delete<B: StorageBackend>(backend: &B) {
    let etag = backend.set(Entry::new("e5", "v")).await.expect("set").expect("accepted");
    assert!(!backend.delete("e5", "stale").await.expect("delete"), "stale delete must fail");
    assert!(backend.get("e5").await.expect("get").is_some());
    assert!(backend.delete("e5", &etag).await.expect("delete"), "current etag must delete");
    assert_eq!(backend.get("e5").await.expect("get"), None);
}

// ============================================================================
// TTL — expiry (3 checks)
// ============================================================================

/// An entry written with a one-second TTL reads as missing once it passes.
pub async fn ttl_key_expires<B: StorageBackend>(backend: &B) {
    backend.set(Entry::new("ttl:short", "v").with_expires_in(1)).await.expect("set");
    let entry = backend.get("ttl:short").await.expect("get").expect("live before expiry");
    assert!(entry.expires_at_unix_seconds > 0, "expiry must be stamped");

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(backend.get("ttl:short").await.expect("get"), None, "expired entry must be missing");
}

/// `expires_in_seconds == 0` never expires.
pub async fn ttl_zero_never_expires<B: StorageBackend>(backend: &B) {
    backend.set(Entry::new("ttl:none", "v")).await.expect("set");
    let entry = backend.get("ttl:none").await.expect("get").expect("present");
    assert_eq!(entry.expires_at_unix_seconds, 0);
}

/// Overwriting without a TTL clears the previous expiry.
pub async fn ttl_overwrite_clears_ttl<B: StorageBackend>(backend: &B) {
    backend.set(Entry::new("ttl:over", "a").with_expires_in(1)).await.expect("set");
    backend.set(Entry::new("ttl:over", "b")).await.expect("overwrite");
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let entry = backend.get("ttl:over").await.expect("get").expect("must survive");
    assert_eq!(entry.value, Some(Bytes::from("b")));
}

// ============================================================================
// Concurrent — parallel access (2 checks)
// ============================================================================

/// 50 concurrent writers to distinct keys all land.
pub async fn concurrent_sets_to_different_keys<B: StorageBackend + 'static>(backend: Arc<B>) {
    let mut handles = Vec::new();
    for i in 0u32..50 {
        let backend = Arc::clone(&backend);
        handles.push(tokio::spawn(async move {
            backend
                .set(Entry::new(format!("conc:{i:04}"), format!("val:{i}")))
                .await
                .expect("concurrent set");
        }));
    }
    for handle in handles {
        handle.await.expect("task join");
    }

    for i in 0u32..50 {
        let entry = backend.get(&format!("conc:{i:04}")).await.expect("get").expect("present");
        assert_eq!(entry.value, Some(Bytes::from(format!("val:{i}"))));
    }
}

/// Of many writers racing with the same etag, exactly one wins.
pub async fn concurrent_conditional_writes_have_one_winner<B: StorageBackend + 'static>(
    backend: Arc<B>,
) {
    let etag = backend.set(Entry::new("race", "start")).await.expect("set").expect("accepted");
    let mut handles = Vec::new();
    for i in 0u32..16 {
        let backend = Arc::clone(&backend);
        let etag = etag.clone();
        handles.push(tokio::spawn(async move {
            backend
                .set(Entry::new("race", format!("writer:{i}")).with_etag(etag))
                .await
                .expect("conditional set")
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.expect("task join").is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one conditional writer may win");
}

// ============================================================================
// Features (1 check)
// ============================================================================

/// The capability descriptor reports usable limits.
pub async fn features_report_limits<B: StorageBackend>(backend: &B) {
    let features = backend.features().await.expect("features");
    assert!(features.max_key_length > 0);
    assert!(features.max_value_size > 0);
}

/// Runs every check against `backend`.
///
/// The checks use distinct keys, so one backend instance serves the whole
/// suite. TTL checks run only when the backend reports `supports_ttl`.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use stowage_storage::{MemoryBackend, conformance};
///
/// #[tokio::test]
/// async fn memory_backend_conforms() {
///     conformance::run_all(Arc::new(MemoryBackend::new())).await;
/// }
/// ```
pub async fn run_all<B: StorageBackend + 'static>(backend: Arc<B>) {
    // CRUD
    crud_get_returns_none_for_missing_key(backend.as_ref()).await;
    crud_set_then_get_returns_value(backend.as_ref()).await;
    crud_set_overwrites_existing(backend.as_ref()).await;
    crud_null_empty_and_missing_are_distinct(backend.as_ref()).await;
    crud_delete_nonexistent_returns_false(backend.as_ref()).await;
    crud_delete_removes_key(backend.as_ref()).await;
    crud_large_value_roundtrip(backend.as_ref()).await;

    // ETag
    etag_set_matches_get(backend.as_ref()).await;
    etag_changes_on_every_write(backend.as_ref()).await;
    etag_stale_write_is_rejected(backend.as_ref()).await;
    etag_conditional_write_to_missing_key_is_rejected(backend.as_ref()).await;
    etag_conditional_delete(backend.as_ref()).await;

    // TTL
    let features = backend.features().await.expect("features");
    if features.supports_ttl {
        ttl_key_expires(backend.as_ref()).await;
        ttl_zero_never_expires(backend.as_ref()).await;
        ttl_overwrite_clears_ttl(backend.as_ref()).await;
    }

    // Concurrent
    concurrent_sets_to_different_keys(Arc::clone(&backend)).await;
    concurrent_conditional_writes_have_one_winner(Arc::clone(&backend)).await;

    // Features
    features_report_limits(backend.as_ref()).await;
}
