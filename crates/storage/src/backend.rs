//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the primitive contract every physical medium
//! implements and every higher layer consumes: feature discovery, conditional
//! set, get, conditional delete and an optional clear.
//!
//! # Contract
//!
//! | Method | Result |
//! |--------|--------|
//! | [`features`](StorageBackend::features) | capability descriptor |
//! | [`set`](StorageBackend::set) | `Some(new_etag)`, or `None` when the etag precondition failed |
//! | [`get`](StorageBackend::get) | `Some(entry)`, or `None` when missing or expired |
//! | [`delete`](StorageBackend::delete) | `true` iff something was removed |
//! | [`clear`](StorageBackend::clear) | best effort; defaults to [`StorageError::NotSupported`] |
//!
//! An empty etag on `set`/`delete` is unconditional. Backends that cannot
//! enforce etags report `supports_etag = false` and may ignore the
//! precondition; wrap them with the etag behavior to get conditional writes.
//!
//! See [`MemoryBackend`](crate::MemoryBackend) for a reference implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{StorageError, StorageResult},
    types::{Entry, Features},
};

/// Primitive key-value contract with optimistic concurrency.
///
/// Backends are expected to be thread-safe (`Send + Sync`) and support
/// concurrent operations on different keys.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns the backend's capability descriptor.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn features(&self) -> StorageResult<Features>;

    /// Stores `entry`, honoring its etag precondition.
    ///
    /// Returns the new etag, or `None` if the precondition was rejected.
    #[must_use = "a rejected write returns None and must be inspected"]
    async fn set(&self, entry: Entry) -> StorageResult<Option<String>>;

    /// Retrieves the entry for `key`.
    ///
    /// Missing and expired keys return `Ok(None)`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> StorageResult<Option<Entry>>;

    /// Removes `key` if `etag` is empty or matches the stored token.
    #[must_use = "a rejected delete returns false and must be inspected"]
    async fn delete(&self, key: &str, etag: &str) -> StorageResult<bool>;

    /// Removes every entry.
    async fn clear(&self) -> StorageResult<()> {
        Err(StorageError::not_supported("clear"))
    }
}

#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    async fn features(&self) -> StorageResult<Features> {
        (**self).features().await
    }

    async fn set(&self, entry: Entry) -> StorageResult<Option<String>> {
        (**self).set(entry).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Entry>> {
        (**self).get(key).await
    }

    async fn delete(&self, key: &str, etag: &str) -> StorageResult<bool> {
        (**self).delete(key, etag).await
    }

    async fn clear(&self) -> StorageResult<()> {
        (**self).clear().await
    }
}
