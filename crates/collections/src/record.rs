//! JSON state records stored through a [`Store`].
//!
//! Collection state records are tiny and read on every operation; JSON keeps
//! them inspectable in any backend. Writes are unconditional because the
//! callers already hold the per-id isolation lane.

use serde::{Serialize, de::DeserializeOwned};
use stowage_storage::{Entry, StorageError, StorageResult, Store};
use tokio_util::sync::CancellationToken;

/// A token that never fires.
///
/// Multi-step state transitions run every inner store call with it, so a
/// caller's cancellation can only land before a step starts.
pub(crate) fn uncancellable() -> CancellationToken {
    CancellationToken::new()
}

/// Reads and decodes the record at `key`; a missing or null record is `None`.
pub(crate) async fn load<T: DeserializeOwned>(
    store: &Store,
    key: &str,
) -> StorageResult<Option<T>> {
    let Some(entry) = store.get(key, &uncancellable()).await? else {
        return Ok(None);
    };
    let Some(value) = entry.value else {
        return Ok(None);
    };
    serde_json::from_slice(&value)
        .map(Some)
        .map_err(|e| StorageError::serialization_with_source(format!("decoding {key}"), e))
}

/// Encodes and writes `record` at `key`.
pub(crate) async fn save<T: Serialize>(store: &Store, key: &str, record: &T) -> StorageResult<()> {
    let value = serde_json::to_vec(record)
        .map_err(|e| StorageError::serialization_with_source(format!("encoding {key}"), e))?;
    match store.set(Entry::new(key, value), &uncancellable()).await? {
        Some(_) => Ok(()),
        None => Err(StorageError::internal(format!("unconditional write to {key} was rejected"))),
    }
}
