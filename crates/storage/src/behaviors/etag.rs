//! Entity-tag moderation for backends without conditional writes.
//!
//! When the backend reports `supports_etag = false`, [`EtagBehavior`] keeps a
//! shadow record `<key>#etag` holding the current token and enforces
//! preconditions against it:
//!
//! - `set` with a non-empty etag that does not match the shadow returns `None`
//! - `delete` with a non-empty etag that does not match the shadow returns `false`
//! - `get` reports the shadow token as the entry's etag
//!
//! Keys that already end in the shadow suffix pass straight through. When the
//! backend supports etags natively the behavior is a pass-through, apart from
//! reporting `supports_etag = true` upward either way.
//!
//! The read-compare-write sequence is not atomic on its own; register the
//! behavior inside the isolation behavior.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    ops::{DeleteRequest, FeaturesRequest, GetRequest, SetRequest},
    pipeline::{Behavior, Next},
    store::{Layer, LayerStack},
    types::{Entry, Features},
};

/// Suffix of the shadow record holding a key's current etag.
pub const ETAG_SUFFIX: &str = "#etag";

/// Emulates conditional set/delete with a shadow etag record per key.
pub struct EtagBehavior {
    shadow: Arc<dyn StorageBackend>,
    native: OnceCell<bool>,
}

impl EtagBehavior {
    /// Keeps shadow records in `shadow`, normally the same backend the
    /// pipeline ends in.
    pub fn new(shadow: Arc<dyn StorageBackend>) -> Self {
        Self { shadow, native: OnceCell::new() }
    }

    fn shadow_key(key: &str) -> String {
        format!("{key}{ETAG_SUFFIX}")
    }

    fn is_shadow_key(key: &str) -> bool {
        key.ends_with(ETAG_SUFFIX)
    }

    async fn is_native(&self) -> StorageResult<bool> {
        self.native
            .get_or_try_init(|| async {
                Ok::<_, StorageError>(self.shadow.features().await?.supports_etag)
            })
            .await
            .copied()
    }

    async fn bypass(&self, key: &str) -> StorageResult<bool> {
        Ok(Self::is_shadow_key(key) || self.is_native().await?)
    }

    async fn current_etag(&self, key: &str) -> StorageResult<Option<String>> {
        let shadow = self.shadow.get(&Self::shadow_key(key)).await?;
        Ok(shadow
            .and_then(|entry| entry.value)
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    async fn matches(&self, key: &str, etag: &str) -> StorageResult<bool> {
        if etag.is_empty() {
            return Ok(true);
        }
        Ok(self.current_etag(key).await?.as_deref() == Some(etag))
    }
}

#[async_trait]
impl Behavior<SetRequest> for EtagBehavior {
    async fn handle(
        &self,
        mut request: SetRequest,
        cancel: &CancellationToken,
        next: Next<SetRequest>,
    ) -> StorageResult<Option<String>> {
        let key = request.entry.key.clone();
        if self.bypass(&key).await? {
            return next.run(request, cancel).await;
        }
        if !self.matches(&key, &request.entry.etag).await? {
            trace!(%key, "etag precondition rejected");
            return Ok(None);
        }

        let expires_in = request.entry.expires_in_seconds;
        let expires_at = request.entry.expires_at_unix_seconds;
        request.entry.etag.clear();
        if next.run(request, cancel).await?.is_none() {
            return Ok(None);
        }

        let etag = uuid::Uuid::new_v4().simple().to_string();
        let mut shadow = Entry::new(Self::shadow_key(&key), Bytes::from(etag.clone()));
        shadow.expires_in_seconds = expires_in;
        shadow.expires_at_unix_seconds = expires_at;
        // Shadow writes are unconditional; the precondition was checked above.
        if self.shadow.set(shadow).await?.is_none() {
            return Err(StorageError::internal(format!("shadow etag write for {key} was rejected")));
        }
        Ok(Some(etag))
    }
}

#[async_trait]
impl Behavior<GetRequest> for EtagBehavior {
    async fn handle(
        &self,
        request: GetRequest,
        cancel: &CancellationToken,
        next: Next<GetRequest>,
    ) -> StorageResult<Option<Entry>> {
        let key = request.key.clone();
        if self.bypass(&key).await? {
            return next.run(request, cancel).await;
        }
        let Some(mut entry) = next.run(request, cancel).await? else {
            return Ok(None);
        };
        entry.etag = self.current_etag(&key).await?.unwrap_or_default();
        Ok(Some(entry))
    }
}

#[async_trait]
impl Behavior<DeleteRequest> for EtagBehavior {
    async fn handle(
        &self,
        mut request: DeleteRequest,
        cancel: &CancellationToken,
        next: Next<DeleteRequest>,
    ) -> StorageResult<bool> {
        let key = request.key.clone();
        if self.bypass(&key).await? {
            return next.run(request, cancel).await;
        }
        if !self.matches(&key, &request.etag).await? {
            trace!(%key, "etag precondition rejected");
            return Ok(false);
        }
        request.etag.clear();
        let removed = next.run(request, cancel).await?;
        // A key written before the behavior was registered has no shadow.
        let shadowed = self.shadow.delete(&Self::shadow_key(&key), "").await?;
        trace!(%key, shadowed, "dropped shadow etag");
        Ok(removed)
    }
}

#[async_trait]
impl Behavior<FeaturesRequest> for EtagBehavior {
    async fn handle(
        &self,
        request: FeaturesRequest,
        cancel: &CancellationToken,
        next: Next<FeaturesRequest>,
    ) -> StorageResult<Features> {
        let mut features = next.run(request, cancel).await?;
        features.supports_etag = true;
        Ok(features)
    }
}

impl Layer for EtagBehavior {
    fn register(self: Arc<Self>, stack: &mut LayerStack) {
        stack.on_set(self.clone());
        stack.on_get(self.clone());
        stack.on_delete(self.clone());
        stack.on_features(self);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        memory::{MemoryBackend, MemoryBackendConfig},
        store::Store,
    };

    fn store(supports_etag: bool) -> (MemoryBackend, Store) {
        let config = MemoryBackendConfig::builder().supports_etag(supports_etag).build().unwrap();
        let backend = MemoryBackend::with_config(config);
        let store = Store::builder(backend.clone())
            .layer(Arc::new(EtagBehavior::new(Arc::new(backend.clone()))))
            .build();
        (backend, store)
    }

    /// Accepts data writes but rejects every shadow record write.
    struct RejectingShadow(MemoryBackend);

    #[async_trait]
    impl StorageBackend for RejectingShadow {
        async fn features(&self) -> StorageResult<Features> {
            self.0.features().await
        }

        async fn set(&self, entry: Entry) -> StorageResult<Option<String>> {
            if entry.key.ends_with(ETAG_SUFFIX) { Ok(None) } else { self.0.set(entry).await }
        }

        async fn get(&self, key: &str) -> StorageResult<Option<Entry>> {
            self.0.get(key).await
        }

        async fn delete(&self, key: &str, etag: &str) -> StorageResult<bool> {
            self.0.delete(key, etag).await
        }
    }

    #[tokio::test]
    async fn rejected_shadow_write_is_an_error() {
        let config = MemoryBackendConfig::builder().supports_etag(false).build().unwrap();
        let backend = MemoryBackend::with_config(config);
        let shadow = Arc::new(RejectingShadow(backend.clone()));
        let store =
            Store::builder(backend.clone()).layer(Arc::new(EtagBehavior::new(shadow))).build();

        let err = store.set(Entry::new("k", "v"), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::Internal { .. }), "{err:?}");
        assert!(backend.get("k#etag").await.unwrap().is_none(), "no token without a shadow");
    }

    #[tokio::test]
    async fn round_trip_and_stale_rejection() {
        let (_, store) = store(false);
        let cancel = CancellationToken::new();

        let first = store.set(Entry::new("k", "a"), &cancel).await.unwrap().unwrap();
        let second =
            store.set(Entry::new("k", "b").with_etag(first.clone()), &cancel).await.unwrap();
        let second = second.expect("current etag must be accepted");
        assert_ne!(first, second);

        let stale =
            store.set(Entry::new("k", "c").with_etag(first.clone()), &cancel).await.unwrap();
        assert_eq!(stale, None);

        let entry = store.get("k", &cancel).await.unwrap().unwrap();
        assert_eq!(entry.value, Some(Bytes::from("b")));
        assert_eq!(entry.etag, second);
    }

    #[tokio::test]
    async fn conditional_delete_uses_shadow() {
        let (backend, store) = store(false);
        let cancel = CancellationToken::new();
        let etag = store.set(Entry::new("k", "a"), &cancel).await.unwrap().unwrap();

        assert!(!store.delete("k", "stale", &cancel).await.unwrap());
        assert!(store.delete("k", &etag, &cancel).await.unwrap());
        assert!(backend.is_empty(), "value and shadow are both removed");
    }

    #[tokio::test]
    async fn shadow_keys_pass_through() {
        let (backend, store) = store(false);
        let cancel = CancellationToken::new();
        store.set(Entry::new("x#etag", "raw"), &cancel).await.unwrap();
        assert_eq!(backend.keys(), vec!["x#etag".to_owned()]);
    }

    #[tokio::test]
    async fn native_backends_are_untouched() {
        let (backend, store) = store(true);
        let cancel = CancellationToken::new();
        let etag = store.set(Entry::new("k", "a"), &cancel).await.unwrap().unwrap();
        assert_eq!(backend.keys(), vec!["k".to_owned()]);
        assert_eq!(store.get("k", &cancel).await.unwrap().unwrap().etag, etag);
    }

    #[tokio::test]
    async fn reports_etag_support() {
        let (_, store) = store(false);
        let features = store.features(&CancellationToken::new()).await.unwrap();
        assert!(features.supports_etag);
    }

    #[tokio::test]
    async fn conditional_set_on_missing_key_is_rejected() {
        let (backend, store) = store(false);
        let result =
            store.set(Entry::new("k", "a").with_etag("ghost"), &CancellationToken::new()).await;
        assert_eq!(result.unwrap(), None);
        assert!(backend.is_empty());
    }
}
