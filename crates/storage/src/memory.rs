//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] implements [`StorageBackend`] over a [`BTreeMap`] and is
//! the backend used by the test suites and examples.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Native etags**: every write mints a fresh UUID token
//! - **Lazy expiry**: expired entries read as missing; an optional background task purges them
//! - **Configurable capabilities**: [`MemoryBackendConfig`] can switch off etag or TTL support
//!   to stand in for backends that lack them
//!
//! # Example
//!
//! ```
//! use stowage_storage::{Entry, MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     let etag = backend.set(Entry::new("greeting", "hello")).await.unwrap();
//!     let entry = backend.get("greeting").await.unwrap().unwrap();
//!
//!     assert_eq!(Some(entry.etag), etag);
//! }
//! ```

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{select, sync::watch, time::sleep};
use tracing::debug;

use crate::{
    backend::StorageBackend,
    error::{ConfigError, StorageResult},
    size_limits::{DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_VALUE_SIZE},
    types::{Entry, Features},
};

/// Configuration for [`MemoryBackend`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryBackendConfig {
    /// Reported and enforced capability descriptor.
    #[serde(default)]
    features: Features,
    /// Interval of the background purge task; `None` relies on lazy expiry.
    #[serde(with = "humantime_serde", default)]
    purge_interval: Option<Duration>,
}

#[bon::bon]
impl MemoryBackendConfig {
    /// Creates a validated backend configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either size limit is zero or the purge
    /// interval is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_KEY_SIZE)] max_key_length: usize,
        #[builder(default = DEFAULT_MAX_VALUE_SIZE)] max_value_size: usize,
        #[builder(default = true)] supports_ttl: bool,
        #[builder(default = true)] supports_etag: bool,
        purge_interval: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        if max_key_length == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_key_length",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if max_value_size == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_value_size",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if purge_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ConfigError::MustBePositive {
                field: "purge_interval",
                value: "0s".into(),
            });
        }
        Ok(Self {
            features: Features { max_key_length, max_value_size, supports_ttl, supports_etag },
            purge_interval,
        })
    }

    /// Returns the capability descriptor.
    #[must_use]
    pub fn features(&self) -> Features {
        self.features
    }

    /// Returns the purge interval, if any.
    #[must_use]
    pub fn purge_interval(&self) -> Option<Duration> {
        self.purge_interval
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Option<Bytes>,
    etag: String,
    expires_in_seconds: i64,
    expires_at_unix_seconds: i64,
    metadata: BTreeMap<String, String>,
}

impl Slot {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at_unix_seconds == 0 || self.expires_at_unix_seconds > now
    }

    fn to_entry(&self, key: &str, expose_etag: bool) -> Entry {
        Entry {
            key: key.to_owned(),
            value: self.value.clone(),
            expires_in_seconds: self.expires_in_seconds,
            expires_at_unix_seconds: self.expires_at_unix_seconds,
            etag: if expose_etag { self.etag.clone() } else { String::new() },
            metadata: self.metadata.clone(),
        }
    }
}

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the purge task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// In-memory storage backend using [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data.
///
/// # Shutdown
///
/// When a purge interval is configured the background task stops once every
/// clone is dropped, or explicitly via [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Slot>>>,
    features: Features,
    shutdown_guard: Option<Arc<ShutdownGuard>>,
}

impl MemoryBackend {
    /// Creates a backend with default features and lazy expiry only.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            features: Features::default(),
            shutdown_guard: None,
        }
    }

    /// Creates a backend from `config`.
    ///
    /// Spawns the purge task when `purge_interval` is set, so this must be
    /// called from within a tokio runtime in that case.
    pub fn with_config(config: MemoryBackendConfig) -> Self {
        let mut backend = Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            features: config.features,
            shutdown_guard: None,
        };
        if let Some(interval) = config.purge_interval {
            let (shutdown_tx, shutdown_rx) = watch::channel(());
            backend.shutdown_guard = Some(Arc::new(ShutdownGuard { shutdown_tx }));
            let data = Arc::downgrade(&backend.data);
            tokio::spawn(async move {
                purge_expired(data, interval, shutdown_rx).await;
            });
        }
        backend
    }

    /// Signals the purge task to stop. A no-op without a purge interval.
    pub fn shutdown(&self) {
        if let Some(guard) = &self.shutdown_guard {
            let _ = guard.shutdown_tx.send(());
        }
    }

    /// Number of stored slots, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Returns every stored key, in order, ignoring expiry.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    fn now(&self) -> i64 {
        if self.features.supports_ttl { Utc::now().timestamp() } else { 0 }
    }

    fn etag_matches(&self, slot: Option<&Slot>, etag: &str, now: i64) -> bool {
        if etag.is_empty() || !self.features.supports_etag {
            return true;
        }
        slot.is_some_and(|slot| slot.is_live(now) && slot.etag == etag)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically removes expired slots until shutdown or until the backend is
/// dropped.
async fn purge_expired(
    data: Weak<RwLock<BTreeMap<String, Slot>>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }

        let Some(data) = data.upgrade() else { return };
        let now = Utc::now().timestamp();
        let mut guard = data.write();
        let before = guard.len();
        guard.retain(|_, slot| slot.is_live(now));
        let purged = before - guard.len();
        if purged > 0 {
            debug!(purged, "purged expired entries");
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn features(&self) -> StorageResult<Features> {
        Ok(self.features)
    }

    #[tracing::instrument(skip(self, entry), fields(key = %entry.key))]
    async fn set(&self, entry: Entry) -> StorageResult<Option<String>> {
        let now = Utc::now().timestamp();
        let mut data = self.data.write();
        if !self.etag_matches(data.get(&entry.key), &entry.etag, self.now()) {
            return Ok(None);
        }

        let etag = uuid::Uuid::new_v4().simple().to_string();
        let mut expires_at = entry.expires_at_unix_seconds;
        if self.features.supports_ttl && entry.expires_in_seconds > 0 {
            expires_at = now.saturating_add(entry.expires_in_seconds);
        }
        data.insert(
            entry.key,
            Slot {
                value: entry.value,
                etag: etag.clone(),
                expires_in_seconds: entry.expires_in_seconds,
                expires_at_unix_seconds: expires_at,
                metadata: entry.metadata,
            },
        );
        Ok(Some(etag))
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, key: &str) -> StorageResult<Option<Entry>> {
        let now = self.now();
        let data = self.data.read();
        Ok(data
            .get(key)
            .filter(|slot| !self.features.supports_ttl || slot.is_live(now))
            .map(|slot| slot.to_entry(key, self.features.supports_etag)))
    }

    #[tracing::instrument(skip(self, etag))]
    async fn delete(&self, key: &str, etag: &str) -> StorageResult<bool> {
        let now = self.now();
        let mut data = self.data.write();
        if !etag.is_empty() && !self.etag_matches(data.get(key), etag, now) {
            return Ok(false);
        }
        match data.remove(key) {
            Some(slot) => Ok(!self.features.supports_ttl || slot.is_live(now)),
            None => Ok(false),
        }
    }

    async fn clear(&self) -> StorageResult<()> {
        self.data.write().clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_returns_fresh_etag_each_write() {
        let backend = MemoryBackend::new();
        let first = backend.set(Entry::new("k", "a")).await.unwrap().unwrap();
        let second = backend.set(Entry::new("k", "b")).await.unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(backend.get("k").await.unwrap().unwrap().etag, second);
    }

    #[tokio::test]
    async fn stale_etag_is_rejected() {
        let backend = MemoryBackend::new();
        let first = backend.set(Entry::new("k", "a")).await.unwrap().unwrap();
        backend.set(Entry::new("k", "b")).await.unwrap().unwrap();

        let rejected = backend.set(Entry::new("k", "c").with_etag(first.clone())).await.unwrap();
        assert_eq!(rejected, None);
        assert!(!backend.delete("k", &first).await.unwrap());

        let stored = backend.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, Some(Bytes::from("b")));
    }

    #[tokio::test]
    async fn conditional_set_on_missing_key_is_rejected() {
        let backend = MemoryBackend::new();
        let result = backend.set(Entry::new("k", "a").with_etag("nope")).await.unwrap();
        assert_eq!(result, None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn delete_reports_removal() {
        let backend = MemoryBackend::new();
        assert!(!backend.delete("k", "").await.unwrap());
        backend.set(Entry::new("k", "a")).await.unwrap();
        assert!(backend.delete("k", "").await.unwrap());
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entry_reads_as_missing() {
        let backend = MemoryBackend::new();
        let mut entry = Entry::new("k", "v");
        entry.expires_at_unix_seconds = Utc::now().timestamp() - 1;
        backend.set(entry).await.unwrap();
        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(backend.len(), 1, "lazy expiry keeps the slot until purged");
    }

    #[tokio::test]
    async fn without_etag_support_preconditions_are_ignored() {
        let config = MemoryBackendConfig::builder().supports_etag(false).build().unwrap();
        let backend = MemoryBackend::with_config(config);
        backend.set(Entry::new("k", "a")).await.unwrap();
        let written = backend.set(Entry::new("k", "b").with_etag("bogus")).await.unwrap();
        assert!(written.is_some());
        let stored = backend.get("k").await.unwrap().unwrap();
        assert!(stored.etag.is_empty());
        assert!(!backend.features().await.unwrap().supports_etag);
    }

    #[tokio::test]
    async fn without_ttl_support_expiry_is_not_enforced() {
        let config = MemoryBackendConfig::builder().supports_ttl(false).build().unwrap();
        let backend = MemoryBackend::with_config(config);
        let mut entry = Entry::new("k", "v").with_expires_in(1);
        entry.expires_at_unix_seconds = 1;
        backend.set(entry).await.unwrap();
        let stored = backend.get("k").await.unwrap().unwrap();
        assert_eq!(stored.expires_at_unix_seconds, 1);
    }

    #[tokio::test]
    async fn purge_task_removes_expired_slots() {
        let config = MemoryBackendConfig::builder()
            .purge_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let backend = MemoryBackend::with_config(config);
        let mut entry = Entry::new("k", "v");
        entry.expires_at_unix_seconds = Utc::now().timestamp() - 1;
        backend.set(entry).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.is_empty());
        backend.shutdown();
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let backend = MemoryBackend::new();
        backend.set(Entry::new("a", "1")).await.unwrap();
        backend.set(Entry::new("b", "2")).await.unwrap();
        backend.clear().await.unwrap();
        assert!(backend.is_empty());
    }

    #[test]
    fn config_rejects_zero_limits() {
        let err = MemoryBackendConfig::builder().max_key_length(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "max_key_length", .. }));
        let err =
            MemoryBackendConfig::builder().purge_interval(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "purge_interval", .. }));
    }
}
