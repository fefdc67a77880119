//! Storage abstraction with composable behavior pipelines.
//!
//! This crate provides the [`StorageBackend`] trait, a small primitive
//! contract (set, get, delete by key with optional etag preconditions and
//! time-to-live), and a [`Store`] that wraps a backend in one statically-typed
//! [`Pipeline`] per operation. Cross-cutting concerns are [`Behavior`]s
//! composed around the backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Collections (stowage-collections)                │
//! │        Queue │ EventStore │ TimeSeries │ Scheduler          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                         Store                               │
//! │   replication ▸ validating ▸ isolation ▸ queued ▸ retry     │
//! │                 ▸ cache ▸ ttl ▸ etag                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    StorageBackend trait                     │
//! │             (features, set, get, delete, clear)             │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ MemoryBackend│        file, Redis, S3, ... (external)       │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use stowage_storage::{
//!     Entry, MemoryBackend, Store,
//!     behaviors::{IsolationBehavior, ValidatingBehavior},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!     let store = Store::builder(backend.clone())
//!         .layer(Arc::new(IsolationBehavior::local()))
//!         .layer(Arc::new(ValidatingBehavior::new(Arc::new(backend))))
//!         .build();
//!
//!     let cancel = CancellationToken::new();
//!     let etag = store.set(Entry::new("user:123", "Alice"), &cancel).await?;
//!     let entry = store.get("user:123", &cancel).await?.expect("just written");
//!     assert_eq!(Some(entry.etag), etag);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Implementing a Backend
//!
//! 1. Implement [`StorageBackend`]
//! 2. Report honest [`Features`]; behaviors fill in missing etag and TTL support
//! 3. Map backend-specific errors to [`StorageError`]
//!
//! See the [`memory`] module source for a reference implementation, and run
//! the [`conformance`] suite against the new backend.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` and `conformance` modules (key/value generators,
//!   failing backends, a recording scheduler, assertion macros, contract checks). Enable this in
//!   `[dev-dependencies]` for integration tests.
//! - **`failpoints`**: Compiles the `fail` crate's fail points into retry and replication.

#![deny(unsafe_code)]

pub mod backend;
pub mod behaviors;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod log;
pub mod memory;
pub mod ops;
pub mod pipeline;
pub mod scheduler;
pub mod size_limits;
pub mod store;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use backend::StorageBackend;
pub use error::{BoxError, ConfigError, ExpectedVersionKind, StorageError, StorageResult};
pub use log::{DurableLog, MemoryLog};
pub use memory::{MemoryBackend, MemoryBackendConfig};
pub use ops::{ClearRequest, DeleteRequest, FeaturesRequest, GetRequest, SetRequest};
pub use pipeline::{Behavior, Handler, KeyedOperation, Next, Operation, Pipeline, chain};
pub use scheduler::{Dispatch, Scheduler};
pub use size_limits::{DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_VALUE_SIZE, validate_entry, validate_key};
pub use store::{BackendHandler, Layer, LayerStack, Store, StoreBuilder};
pub use types::{Entry, Features, REPLAY_MARKER};
