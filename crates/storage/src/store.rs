//! The [`Store`] facade: one pipeline per primitive operation, each ending in
//! the backend.
//!
//! Behaviors are registered as [`Layer`]s. A layer decides which operations it
//! participates in by pushing itself onto the matching stacks of a
//! [`LayerStack`]; the compiler checks that it implements [`Behavior`] for each
//! one.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stowage_storage::{
//!     Entry, MemoryBackend, Store,
//!     behaviors::{IsolationBehavior, ValidatingBehavior},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(MemoryBackend::new());
//! let store = Store::builder(backend.clone())
//!     .layer(Arc::new(IsolationBehavior::local()))
//!     .layer(Arc::new(ValidatingBehavior::new(backend)))
//!     .build();
//!
//! let cancel = CancellationToken::new();
//! let etag = store.set(Entry::new("k", "v"), &cancel).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    ops::{ClearRequest, DeleteRequest, FeaturesRequest, GetRequest, SetRequest},
    pipeline::{Behavior, Handler, Pipeline, chain_arc},
    types::{Entry, Features},
};

/// A behavior that can be registered on a [`StoreBuilder`].
pub trait Layer: Send + Sync + 'static {
    /// Pushes `self` onto the stacks of every operation it wraps.
    fn register(self: Arc<Self>, stack: &mut LayerStack);
}

/// Per-operation behavior stacks collected while building a [`Store`].
#[derive(Default)]
pub struct LayerStack {
    set: Vec<Arc<dyn Behavior<SetRequest>>>,
    get: Vec<Arc<dyn Behavior<GetRequest>>>,
    delete: Vec<Arc<dyn Behavior<DeleteRequest>>>,
    features: Vec<Arc<dyn Behavior<FeaturesRequest>>>,
    clear: Vec<Arc<dyn Behavior<ClearRequest>>>,
}

impl LayerStack {
    /// Wraps the set pipeline.
    pub fn on_set(&mut self, behavior: Arc<dyn Behavior<SetRequest>>) {
        self.set.push(behavior);
    }

    /// Wraps the get pipeline.
    pub fn on_get(&mut self, behavior: Arc<dyn Behavior<GetRequest>>) {
        self.get.push(behavior);
    }

    /// Wraps the delete pipeline.
    pub fn on_delete(&mut self, behavior: Arc<dyn Behavior<DeleteRequest>>) {
        self.delete.push(behavior);
    }

    /// Wraps the features pipeline.
    pub fn on_features(&mut self, behavior: Arc<dyn Behavior<FeaturesRequest>>) {
        self.features.push(behavior);
    }

    /// Wraps the clear pipeline.
    pub fn on_clear(&mut self, behavior: Arc<dyn Behavior<ClearRequest>>) {
        self.clear.push(behavior);
    }
}

/// Terminal handler forwarding every primitive operation to a backend.
///
/// Checks cancellation before issuing the backend call; an in-flight call is
/// never interrupted.
pub struct BackendHandler {
    backend: Arc<dyn StorageBackend>,
}

impl BackendHandler {
    /// Wraps `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }
}

fn ensure_live(cancel: &CancellationToken) -> StorageResult<()> {
    if cancel.is_cancelled() { Err(StorageError::Cancelled) } else { Ok(()) }
}

#[async_trait]
impl Handler<SetRequest> for BackendHandler {
    async fn handle(
        &self,
        request: SetRequest,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<String>> {
        ensure_live(cancel)?;
        self.backend.set(request.entry).await
    }
}

#[async_trait]
impl Handler<GetRequest> for BackendHandler {
    async fn handle(
        &self,
        request: GetRequest,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<Entry>> {
        ensure_live(cancel)?;
        self.backend.get(&request.key).await
    }
}

#[async_trait]
impl Handler<DeleteRequest> for BackendHandler {
    async fn handle(
        &self,
        request: DeleteRequest,
        cancel: &CancellationToken,
    ) -> StorageResult<bool> {
        ensure_live(cancel)?;
        self.backend.delete(&request.key, &request.etag).await
    }
}

#[async_trait]
impl Handler<FeaturesRequest> for BackendHandler {
    async fn handle(
        &self,
        _request: FeaturesRequest,
        cancel: &CancellationToken,
    ) -> StorageResult<Features> {
        ensure_live(cancel)?;
        self.backend.features().await
    }
}

#[async_trait]
impl Handler<ClearRequest> for BackendHandler {
    async fn handle(
        &self,
        _request: ClearRequest,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        ensure_live(cancel)?;
        self.backend.clear().await
    }
}

/// A backend wrapped in composed behavior pipelines.
///
/// Cheap to clone; clones share pipelines and behaviors.
#[derive(Clone)]
pub struct Store {
    set: Pipeline<SetRequest>,
    get: Pipeline<GetRequest>,
    delete: Pipeline<DeleteRequest>,
    features: Pipeline<FeaturesRequest>,
    clear: Pipeline<ClearRequest>,
}

impl Store {
    /// Starts a store over `backend`.
    pub fn builder(backend: impl StorageBackend + 'static) -> StoreBuilder {
        StoreBuilder { backend: Arc::new(backend), stack: LayerStack::default() }
    }

    /// Writes `entry`; `None` means the etag precondition was rejected.
    pub async fn set(
        &self,
        entry: Entry,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<String>> {
        self.set.execute(SetRequest { entry }, cancel).await
    }

    /// Reads `key`; `None` means missing or expired.
    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> StorageResult<Option<Entry>> {
        self.get.execute(GetRequest { key: key.to_owned() }, cancel).await
    }

    /// Deletes `key` if `etag` is empty or current.
    pub async fn delete(
        &self,
        key: &str,
        etag: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<bool> {
        self.delete.execute(DeleteRequest::new(key, etag), cancel).await
    }

    /// Executes a fully specified delete request, headers included.
    pub async fn delete_with(
        &self,
        request: DeleteRequest,
        cancel: &CancellationToken,
    ) -> StorageResult<bool> {
        self.delete.execute(request, cancel).await
    }

    /// Returns the capability descriptor as adjusted by the behaviors.
    pub async fn features(&self, cancel: &CancellationToken) -> StorageResult<Features> {
        self.features.execute(FeaturesRequest, cancel).await
    }

    /// Removes every entry.
    pub async fn clear(&self, cancel: &CancellationToken) -> StorageResult<()> {
        self.clear.execute(ClearRequest, cancel).await
    }
}

/// Builder for [`Store`].
pub struct StoreBuilder {
    backend: Arc<dyn StorageBackend>,
    stack: LayerStack,
}

impl StoreBuilder {
    /// Registers `layer` outside every layer registered so far.
    #[must_use]
    pub fn layer<L: Layer>(mut self, layer: Arc<L>) -> Self {
        layer.register(&mut self.stack);
        self
    }

    /// Builds the store.
    #[must_use]
    pub fn build(self) -> Store {
        let handler = Arc::new(BackendHandler::new(self.backend));
        let LayerStack { set, get, delete, features, clear } = self.stack;
        Store {
            set: chain_arc::<SetRequest>(handler.clone(), set),
            get: chain_arc::<GetRequest>(handler.clone(), get),
            delete: chain_arc::<DeleteRequest>(handler.clone(), delete),
            features: chain_arc::<FeaturesRequest>(handler.clone(), features),
            clear: chain_arc::<ClearRequest>(handler, clear),
        }
    }
}

/// A store is itself a backend, so stores nest. Calls made through the
/// contract run with a fresh token and cannot be cancelled.
#[async_trait]
impl StorageBackend for Store {
    async fn features(&self) -> StorageResult<Features> {
        Store::features(self, &CancellationToken::new()).await
    }

    async fn set(&self, entry: Entry) -> StorageResult<Option<String>> {
        Store::set(self, entry, &CancellationToken::new()).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Entry>> {
        Store::get(self, key, &CancellationToken::new()).await
    }

    async fn delete(&self, key: &str, etag: &str) -> StorageResult<bool> {
        Store::delete(self, key, etag, &CancellationToken::new()).await
    }

    async fn clear(&self) -> StorageResult<()> {
        Store::clear(self, &CancellationToken::new()).await
    }
}
