//! Precondition checks against the backend's advertised limits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    ops::{DeleteRequest, GetRequest, SetRequest},
    pipeline::{Behavior, Next},
    size_limits::{validate_entry, validate_key},
    store::{Layer, LayerStack},
    types::{Entry, Features},
};

/// Rejects empty keys, oversize keys and oversize values before they reach
/// the backend.
///
/// Limits are read from the backend once, on first use.
pub struct ValidatingBehavior {
    source: Option<Arc<dyn StorageBackend>>,
    features: OnceCell<Features>,
}

impl ValidatingBehavior {
    /// Validates against the features `source` reports.
    pub fn new(source: Arc<dyn StorageBackend>) -> Self {
        Self { source: Some(source), features: OnceCell::new() }
    }

    /// Validates against fixed limits.
    #[must_use]
    pub fn with_features(features: Features) -> Self {
        Self { source: None, features: OnceCell::new_with(Some(features)) }
    }

    async fn features(&self) -> StorageResult<Features> {
        let source = self.source.as_ref();
        self.features
            .get_or_try_init(|| async move {
                match source {
                    Some(source) => source.features().await,
                    None => {
                        Err(StorageError::internal("validating behavior has no feature source"))
                    },
                }
            })
            .await
            .copied()
    }
}

#[async_trait]
impl Behavior<SetRequest> for ValidatingBehavior {
    async fn handle(
        &self,
        request: SetRequest,
        cancel: &CancellationToken,
        next: Next<SetRequest>,
    ) -> StorageResult<Option<String>> {
        validate_entry(&request.entry, &self.features().await?)?;
        next.run(request, cancel).await
    }
}

#[async_trait]
impl Behavior<GetRequest> for ValidatingBehavior {
    async fn handle(
        &self,
        request: GetRequest,
        cancel: &CancellationToken,
        next: Next<GetRequest>,
    ) -> StorageResult<Option<Entry>> {
        validate_key(&request.key, &self.features().await?)?;
        next.run(request, cancel).await
    }
}

#[async_trait]
impl Behavior<DeleteRequest> for ValidatingBehavior {
    async fn handle(
        &self,
        request: DeleteRequest,
        cancel: &CancellationToken,
        next: Next<DeleteRequest>,
    ) -> StorageResult<bool> {
        validate_key(&request.key, &self.features().await?)?;
        next.run(request, cancel).await
    }
}

impl Layer for ValidatingBehavior {
    fn register(self: Arc<Self>, stack: &mut LayerStack) {
        stack.on_set(self.clone());
        stack.on_get(self.clone());
        stack.on_delete(self);
    }
}
