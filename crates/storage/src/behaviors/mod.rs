//! Standard behaviors for [`Store`](crate::Store) pipelines.
//!
//! Each behavior is a [`Layer`](crate::Layer) and registers itself on the
//! operations it wraps. A typical full stack, innermost first:
//!
//! ```text
//! EtagBehavior, TtlBehavior, CacheBehavior, RetryBehavior,
//! QueuedWriteBehavior, IsolationBehavior, ValidatingBehavior,
//! ReplicationBehavior
//! ```
//!
//! Isolation sits outside the cache and the write queue so their
//! read-modify-write steps run under per-key exclusion. Replication is
//! outermost because its replayer re-enters the store.

pub mod cache;
pub mod etag;
pub mod isolation;
pub mod queued;
pub mod replication;
pub mod retry;
pub mod ttl;
pub mod validating;

pub use cache::{CacheBehavior, CacheConfig, CacheConfigBuilder, ExpiryPolicy};
pub use etag::{ETAG_SUFFIX, EtagBehavior};
pub use isolation::{ExclusiveExecutor, IsolationBehavior, LocalExecutor};
pub use queued::{QueuedWriteBehavior, QueuedWriteConfig};
pub use replication::{Mutation, ReplicationBehavior, ReplicationConfig, TransactionRecord};
pub use retry::{RetryBehavior, RetryConfig, RetryPredicate};
pub use ttl::{ExpiryDispatcher, ExpiryNotice, TtlBehavior};
pub use validating::ValidatingBehavior;
