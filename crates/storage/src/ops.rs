//! Request types for the primitive operations.
//!
//! Each type is an [`Operation`] carried by its own [`Pipeline`](crate::Pipeline)
//! inside a [`Store`](crate::Store).

use std::collections::BTreeMap;

use crate::{
    pipeline::{KeyedOperation, Operation},
    types::{Entry, Features, REPLAY_MARKER},
};

/// Store `entry`; yields the new etag or `None` when rejected.
#[derive(Debug, Clone)]
pub struct SetRequest {
    /// The entry to write, including its etag precondition.
    pub entry: Entry,
}

impl Operation for SetRequest {
    type Output = Option<String>;
    const NAME: &'static str = "set";
}

impl KeyedOperation for SetRequest {
    fn key(&self) -> &str {
        &self.entry.key
    }
}

/// Read a key; yields `None` when missing or expired.
#[derive(Debug, Clone)]
pub struct GetRequest {
    /// The key to read.
    pub key: String,
}

impl Operation for GetRequest {
    type Output = Option<Entry>;
    const NAME: &'static str = "get";
}

impl KeyedOperation for GetRequest {
    fn key(&self) -> &str {
        &self.key
    }
}

/// Remove a key; yields `true` iff something was removed.
#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    /// The key to remove.
    pub key: String,
    /// Precondition; empty deletes unconditionally.
    pub etag: String,
    /// Request headers, used for the replay marker.
    pub metadata: BTreeMap<String, String>,
}

impl DeleteRequest {
    /// Creates a delete request without headers.
    #[must_use]
    pub fn new(key: impl Into<String>, etag: impl Into<String>) -> Self {
        Self { key: key.into(), etag: etag.into(), metadata: BTreeMap::new() }
    }

    /// Returns `true` if the replication relay issued this request.
    #[must_use]
    pub fn is_replayed(&self) -> bool {
        self.metadata.contains_key(REPLAY_MARKER)
    }
}

impl Operation for DeleteRequest {
    type Output = bool;
    const NAME: &'static str = "delete";
}

impl KeyedOperation for DeleteRequest {
    fn key(&self) -> &str {
        &self.key
    }
}

/// Fetch the capability descriptor as seen through the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeaturesRequest;

impl Operation for FeaturesRequest {
    type Output = Features;
    const NAME: &'static str = "features";
}

/// Remove every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearRequest;

impl Operation for ClearRequest {
    type Output = ();
    const NAME: &'static str = "clear";
}
