//! Time-to-live expiry.
//!
//! On `set` with `expires_in_seconds > 0`, [`TtlBehavior`] stamps the entry's
//! absolute expiry and schedules an [`ExpiryNotice`] through a [`Scheduler`].
//! When the notice falls due, [`ExpiryDispatcher`] deletes the key *by etag*,
//! so a value rewritten in the meantime survives. Reads treat entries whose
//! expiry has passed as missing even before the delete lands.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    error::{StorageError, StorageResult},
    ops::{DeleteRequest, FeaturesRequest, GetRequest, SetRequest},
    pipeline::{Behavior, Next},
    scheduler::{Dispatch, Scheduler},
    store::{Layer, LayerStack, Store},
    types::{Entry, Features},
};

/// Prefix of scheduler ids owned by the TTL behavior.
pub const EXPIRY_ID_PREFIX: &str = "ttl:";

/// Payload of a scheduled expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryNotice {
    /// The key to delete.
    pub key: String,
    /// The etag the key had when the expiry was scheduled.
    pub etag: String,
}

impl ExpiryNotice {
    /// Encodes the notice as a scheduler payload.
    pub fn encode(&self) -> StorageResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a scheduler payload.
    pub fn decode(payload: &[u8]) -> StorageResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

fn expiry_id(key: &str) -> String {
    format!("{EXPIRY_ID_PREFIX}{key}")
}

/// Schedules deletes for entries written with a time-to-live.
pub struct TtlBehavior {
    scheduler: Arc<dyn Scheduler>,
}

impl TtlBehavior {
    /// Schedules expiries through `scheduler`.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Behavior<SetRequest> for TtlBehavior {
    async fn handle(
        &self,
        mut request: SetRequest,
        cancel: &CancellationToken,
        next: Next<SetRequest>,
    ) -> StorageResult<Option<String>> {
        let key = request.entry.key.clone();
        let expires_in = request.entry.expires_in_seconds;
        request.entry.stamp_expiry(Utc::now().timestamp());

        let Some(etag) = next.run(request, cancel).await? else {
            return Ok(None);
        };

        if expires_in > 0 {
            let notice = ExpiryNotice { key: key.clone(), etag: etag.clone() };
            let trigger_in = Duration::from_secs(expires_in.unsigned_abs());
            self.scheduler.schedule(&expiry_id(&key), notice.encode()?, trigger_in, None).await?;
            trace!(%key, expires_in, "scheduled expiry");
        } else {
            self.scheduler.cancel(&expiry_id(&key)).await?;
        }
        Ok(Some(etag))
    }
}

#[async_trait]
impl Behavior<GetRequest> for TtlBehavior {
    async fn handle(
        &self,
        request: GetRequest,
        cancel: &CancellationToken,
        next: Next<GetRequest>,
    ) -> StorageResult<Option<Entry>> {
        let entry = next.run(request, cancel).await?;
        Ok(entry.filter(|entry| !entry.is_expired()))
    }
}

#[async_trait]
impl Behavior<DeleteRequest> for TtlBehavior {
    async fn handle(
        &self,
        request: DeleteRequest,
        cancel: &CancellationToken,
        next: Next<DeleteRequest>,
    ) -> StorageResult<bool> {
        let key = request.key.clone();
        let removed = next.run(request, cancel).await?;
        if removed {
            self.scheduler.cancel(&expiry_id(&key)).await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl Behavior<FeaturesRequest> for TtlBehavior {
    async fn handle(
        &self,
        request: FeaturesRequest,
        cancel: &CancellationToken,
        next: Next<FeaturesRequest>,
    ) -> StorageResult<Features> {
        let mut features = next.run(request, cancel).await?;
        features.supports_ttl = true;
        Ok(features)
    }
}

impl Layer for TtlBehavior {
    fn register(self: Arc<Self>, stack: &mut LayerStack) {
        stack.on_set(self.clone());
        stack.on_get(self.clone());
        stack.on_delete(self.clone());
        stack.on_features(self);
    }
}

/// Applies due [`ExpiryNotice`]s by deleting through a [`Store`].
pub struct ExpiryDispatcher {
    store: Store,
}

impl ExpiryDispatcher {
    /// Deletes expired keys through `store`.
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Dispatch for ExpiryDispatcher {
    async fn dispatch(&self, id: &str, payload: Bytes) -> StorageResult<()> {
        if !id.starts_with(EXPIRY_ID_PREFIX) {
            return Err(StorageError::invalid_argument(format!("not an expiry notice: {id}")));
        }
        let notice = ExpiryNotice::decode(&payload)?;
        let removed = self
            .store
            .delete_with(DeleteRequest::new(&notice.key, &notice.etag), &CancellationToken::new())
            .await?;
        debug!(key = %notice.key, removed, "applied expiry");
        Ok(())
    }
}
