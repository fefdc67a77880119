//! Core record types shared by every layer of a store.
//!
//! [`Entry`] is the unit of storage. Its `value` is an `Option<Bytes>` so a
//! stored null (`None`) and a stored empty buffer (`Some(Bytes::new())`) stay
//! distinguishable end to end. A key that is missing or expired is reported as
//! `Option<Entry>::None` by every read path; that is the "null entry" sentinel.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::size_limits::{DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_VALUE_SIZE};

/// Metadata header attached to entries by the replication relay when it
/// replays a committed log record. Behaviors that would re-trigger themselves
/// skip entries carrying it.
pub const REPLAY_MARKER: &str = "stowage-replayed";

/// A single stored record.
///
/// On write, `etag` is a precondition: empty means unconditional, anything
/// else must match the stored token. On read, `etag` is the current token.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entry {
    /// The record key.
    pub key: String,
    /// The payload; `None` is a stored null.
    pub value: Option<Bytes>,
    /// Relative time-to-live requested on write. `0` disables expiry.
    pub expires_in_seconds: i64,
    /// Absolute expiry computed on write. `0` means never.
    pub expires_at_unix_seconds: i64,
    /// Optimistic-concurrency token.
    pub etag: String,
    /// Small header envelope carried alongside the value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Entry {
    /// Creates an unconditional entry holding `value`.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self { key: key.into(), value: Some(value.into()), ..Self::default() }
    }

    /// Creates an unconditional entry holding a stored null.
    #[must_use]
    pub fn null(key: impl Into<String>) -> Self {
        Self { key: key.into(), ..Self::default() }
    }

    /// Sets the etag precondition.
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = etag.into();
        self
    }

    /// Sets the relative time-to-live in seconds.
    #[must_use]
    pub fn with_expires_in(mut self, seconds: i64) -> Self {
        self.expires_in_seconds = seconds;
        self
    }

    /// Adds a metadata header.
    #[must_use]
    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Returns the payload length, counting a stored null as zero.
    #[must_use]
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, Bytes::len)
    }

    /// Returns `true` if `expires_at_unix_seconds` is set and not after `now`.
    #[must_use]
    pub fn is_expired_at(&self, now_unix_seconds: i64) -> bool {
        self.expires_at_unix_seconds > 0 && self.expires_at_unix_seconds <= now_unix_seconds
    }

    /// Returns `true` if the entry has expired relative to the wall clock.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }

    /// Stamps `expires_at_unix_seconds` from `expires_in_seconds`.
    pub fn stamp_expiry(&mut self, now_unix_seconds: i64) {
        self.expires_at_unix_seconds = if self.expires_in_seconds > 0 {
            now_unix_seconds.saturating_add(self.expires_in_seconds)
        } else {
            0
        };
    }

    /// Returns `true` if the replication relay wrote this entry.
    #[must_use]
    pub fn is_replayed(&self) -> bool {
        self.metadata.contains_key(REPLAY_MARKER)
    }
}

/// Capability descriptor reported by a backend.
///
/// Consumers degrade gracefully when a capability is missing; for example the
/// etag behavior only emulates conditional writes when `supports_etag` is
/// `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// Longest accepted key, in bytes.
    pub max_key_length: usize,
    /// Largest accepted value, in bytes.
    pub max_value_size: usize,
    /// Whether the backend expires entries on its own.
    pub supports_ttl: bool,
    /// Whether the backend enforces etag preconditions natively.
    pub supports_etag: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            max_key_length: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            supports_ttl: true,
            supports_etag: true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn null_and_empty_are_distinct() {
        let null = Entry::null("k");
        let empty = Entry::new("k", Bytes::new());
        assert_ne!(null, empty);
        assert_eq!(null.value_len(), 0);
        assert_eq!(empty.value_len(), 0);
        assert!(null.value.is_none());
        assert!(empty.value.is_some());
    }

    #[test]
    fn stamp_expiry_honors_zero() {
        let mut entry = Entry::new("k", "v");
        entry.stamp_expiry(1_000);
        assert_eq!(entry.expires_at_unix_seconds, 0);
        assert!(!entry.is_expired_at(i64::MAX));

        let mut entry = Entry::new("k", "v").with_expires_in(30);
        entry.stamp_expiry(1_000);
        assert_eq!(entry.expires_at_unix_seconds, 1_030);
        assert!(!entry.is_expired_at(1_029));
        assert!(entry.is_expired_at(1_030));
    }

    #[test]
    fn replay_marker_detection() {
        let entry = Entry::new("k", "v").with_metadata(REPLAY_MARKER, "w1:4");
        assert!(entry.is_replayed());
        assert!(!Entry::new("k", "v").is_replayed());
    }

    #[test]
    fn entry_serde_keeps_null() {
        let entry = Entry::null("k").with_etag("e1");
        let json = serde_json::to_string(&entry).unwrap();
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert!(back.value.is_none());
    }
}
