//! Read-through cache behavior.
//!
//! [`CacheBehavior`] answers `get` from a [`moka`] cache when it can and
//! populates the cache on a miss. Writes invalidate the cached key before and
//! after the write, so the next read after a successful `set`/`delete` never
//! sees a value predating it.
//!
//! # Design
//!
//! - **Nulls are not cached**: a missing key is always re-read from the backend.
//! - **Caller-supplied expiry**: an [`ExpiryPolicy`] decides how long each entry may stay
//!   cached; the default caps it at the configured TTL and at the entry's own expiry.
//! - **Prefixing**: cache keys carry a prefix so several stores can share one process
//!   without colliding.
//!
//! Register the cache inside the isolation behavior so invalidation runs under
//! the same per-key exclusion as the write it invalidates.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use moka::{Expiry, future::Cache};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    error::{ConfigError, StorageResult},
    ops::{ClearRequest, DeleteRequest, GetRequest, SetRequest},
    pipeline::{Behavior, Next},
    store::{Layer, LayerStack},
    types::Entry,
};

/// Default maximum number of cache entries.
const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Default cache TTL.
const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Minimum allowed cache TTL.
const MIN_TTL: Duration = Duration::from_secs(1);

/// Decides how long a freshly read entry may be cached. `None` falls back to
/// the configured TTL.
pub type ExpiryPolicy = Arc<dyn Fn(&Entry) -> Option<Duration> + Send + Sync>;

/// Configuration for the read-through cache.
///
/// # Validation
///
/// - `max_entries` must be >= 1
/// - `ttl` must be >= 1 second
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use stowage_storage::behaviors::CacheConfig;
/// let config = CacheConfig::builder()
///     .max_entries(5_000)
///     .ttl(Duration::from_secs(120))
///     .prefix("users:")
///     .build()
///     .expect("valid config");
/// ```
#[derive(Clone)]
pub struct CacheConfig {
    max_entries: u64,
    ttl: Duration,
    prefix: String,
    policy: Option<ExpiryPolicy>,
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .field("prefix", &self.prefix)
            .field("policy", &self.policy.is_some())
            .finish()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_TTL,
            prefix: String::new(),
            policy: None,
        }
    }
}

impl CacheConfig {
    /// Starts a validated cache configuration.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder { config: Self::default() }
    }

    /// Returns the maximum number of cache entries.
    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// Returns the cache TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cache key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Builder for [`CacheConfig`].
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Sets the maximum number of entries in the cache.
    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.config.max_entries = max_entries;
        self
    }

    /// Sets the upper bound on how long an entry stays cached.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Sets the cache key prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Sets the per-entry expiry policy.
    pub fn expiry_policy(
        mut self,
        policy: impl Fn(&Entry) -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.config.policy = Some(Arc::new(policy));
        self
    }

    /// Builds the [`CacheConfig`], validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `max_entries` is 0
    /// - `ttl` is less than 1 second
    pub fn build(self) -> Result<CacheConfig, ConfigError> {
        if self.config.max_entries == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_entries",
                value: self.config.max_entries.to_string(),
                min: "1".to_owned(),
            });
        }
        if self.config.ttl < MIN_TTL {
            return Err(ConfigError::BelowMinimum {
                field: "ttl",
                value: format!("{}ms", self.config.ttl.as_millis()),
                min: "1s".to_owned(),
            });
        }
        Ok(self.config)
    }
}

struct EntryExpiry {
    ttl: Duration,
    policy: Option<ExpiryPolicy>,
}

impl EntryExpiry {
    fn lifetime(&self, entry: &Entry) -> Duration {
        let mut lifetime =
            self.policy.as_ref().and_then(|policy| policy(entry)).unwrap_or(self.ttl);
        if entry.expires_at_unix_seconds > 0 {
            let remaining = entry.expires_at_unix_seconds.saturating_sub(Utc::now().timestamp());
            lifetime = lifetime.min(Duration::from_secs(u64::try_from(remaining).unwrap_or(0)));
        }
        lifetime
    }
}

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.lifetime(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.lifetime(value))
    }
}

/// Read-through cache in front of the rest of the pipeline.
pub struct CacheBehavior {
    cache: Cache<String, Entry>,
    prefix: String,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheBehavior {
    /// Creates a cache behavior from `config`.
    pub fn new(config: CacheConfig) -> Self {
        let expiry = EntryExpiry { ttl: config.ttl, policy: config.policy };
        let cache = Cache::builder().max_capacity(config.max_entries).expire_after(expiry).build();
        Self { cache, prefix: config.prefix, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Returns `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    /// Number of cached entries; moka updates this lazily.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Invalidates every cached entry.
    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }
}

#[async_trait]
impl Behavior<GetRequest> for CacheBehavior {
    async fn handle(
        &self,
        request: GetRequest,
        cancel: &CancellationToken,
        next: Next<GetRequest>,
    ) -> StorageResult<Option<Entry>> {
        let cache_key = self.cache_key(&request.key);
        if let Some(entry) = self.cache.get(&cache_key).await {
            if !entry.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = %request.key, "cache hit");
                return Ok(Some(entry));
            }
            self.cache.invalidate(&cache_key).await;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = next.run(request, cancel).await?;
        if let Some(entry) = &result {
            self.cache.insert(cache_key, entry.clone()).await;
            trace!(key = %entry.key, "cache miss, populated");
        }
        Ok(result)
    }
}

#[async_trait]
impl Behavior<SetRequest> for CacheBehavior {
    async fn handle(
        &self,
        request: SetRequest,
        cancel: &CancellationToken,
        next: Next<SetRequest>,
    ) -> StorageResult<Option<String>> {
        let cache_key = self.cache_key(&request.entry.key);
        self.cache.invalidate(&cache_key).await;
        let result = next.run(request, cancel).await;
        self.cache.invalidate(&cache_key).await;
        result
    }
}

#[async_trait]
impl Behavior<DeleteRequest> for CacheBehavior {
    async fn handle(
        &self,
        request: DeleteRequest,
        cancel: &CancellationToken,
        next: Next<DeleteRequest>,
    ) -> StorageResult<bool> {
        let cache_key = self.cache_key(&request.key);
        self.cache.invalidate(&cache_key).await;
        let result = next.run(request, cancel).await;
        self.cache.invalidate(&cache_key).await;
        result
    }
}

#[async_trait]
impl Behavior<ClearRequest> for CacheBehavior {
    async fn handle(
        &self,
        request: ClearRequest,
        cancel: &CancellationToken,
        next: Next<ClearRequest>,
    ) -> StorageResult<()> {
        let result = next.run(request, cancel).await;
        self.cache.invalidate_all();
        result
    }
}

impl Layer for CacheBehavior {
    fn register(self: Arc<Self>, stack: &mut LayerStack) {
        stack.on_set(self.clone());
        stack.on_get(self.clone());
        stack.on_delete(self.clone());
        stack.on_clear(self);
    }
}
