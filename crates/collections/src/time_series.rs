//! Time-indexed collections.
//!
//! A [`TimeSeries`] pairs an [`OrderedIndex`] (member = entry id, score =
//! encoded timestamp) with payload entries in a [`Store`]. Writes land on the
//! payload first and the index second, so the index can only ever point at a
//! payload that vanished, never miss one that exists. Range reads prune such
//! dangling index members as they find them.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use stowage_storage::{Entry, StorageError, StorageResult, Store};
use tracing::debug;

use crate::{
    keys::{self, encode_timestamp},
    record::uncancellable,
};

/// A sorted set of members per index name, ordered by an opaque byte score.
///
/// Ties between equal scores are broken by member name.
#[async_trait]
pub trait OrderedIndex: Send + Sync {
    /// Inserts `member` or moves it to `score`.
    async fn upsert(&self, index: &str, member: &str, score: &[u8]) -> StorageResult<()>;

    /// Removes `member`; returns `true` if it was present.
    async fn remove(&self, index: &str, member: &str) -> StorageResult<bool>;

    /// Members whose score lies in `[from, to]`, ascending.
    async fn range(
        &self,
        index: &str,
        from: &[u8],
        to: &[u8],
    ) -> StorageResult<Vec<(String, Bytes)>>;

    /// The score of `member`, if present.
    async fn get(&self, index: &str, member: &str) -> StorageResult<Option<Bytes>>;
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, Bytes>,
    ordered: BTreeSet<(Bytes, String)>,
}

/// In-process [`OrderedIndex`].
#[derive(Clone, Default)]
pub struct MemoryIndex {
    sets: Arc<RwLock<HashMap<String, SortedSet>>>,
}

impl MemoryIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members in `index`.
    #[must_use]
    pub fn len(&self, index: &str) -> usize {
        self.sets.read().get(index).map_or(0, |set| set.scores.len())
    }
}

#[async_trait]
impl OrderedIndex for MemoryIndex {
    async fn upsert(&self, index: &str, member: &str, score: &[u8]) -> StorageResult<()> {
        let mut sets = self.sets.write();
        let set = sets.entry(index.to_owned()).or_default();
        let score = Bytes::copy_from_slice(score);
        if let Some(previous) = set.scores.insert(member.to_owned(), score.clone()) {
            set.ordered.remove(&(previous, member.to_owned()));
        }
        set.ordered.insert((score, member.to_owned()));
        Ok(())
    }

    async fn remove(&self, index: &str, member: &str) -> StorageResult<bool> {
        let mut sets = self.sets.write();
        let Some(set) = sets.get_mut(index) else {
            return Ok(false);
        };
        let Some(score) = set.scores.remove(member) else {
            return Ok(false);
        };
        set.ordered.remove(&(score, member.to_owned()));
        if set.scores.is_empty() {
            sets.remove(index);
        }
        Ok(true)
    }

    async fn range(
        &self,
        index: &str,
        from: &[u8],
        to: &[u8],
    ) -> StorageResult<Vec<(String, Bytes)>> {
        if from > to {
            return Ok(Vec::new());
        }
        let sets = self.sets.read();
        let Some(set) = sets.get(index) else {
            return Ok(Vec::new());
        };
        let lower = (Bytes::copy_from_slice(from), String::new());
        Ok(set
            .ordered
            .range(lower..)
            .take_while(|(score, _)| score.as_ref() <= to)
            .map(|(score, member)| (member.clone(), score.clone()))
            .collect())
    }

    async fn get(&self, index: &str, member: &str) -> StorageResult<Option<Bytes>> {
        Ok(self.sets.read().get(index).and_then(|set| set.scores.get(member).cloned()))
    }
}

/// One point of a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSeriesEntry {
    /// Entry id, unique within the series.
    pub id: String,
    /// The entry's position in time.
    pub timestamp: DateTime<Utc>,
    /// Opaque payload.
    pub data: Bytes,
}

#[derive(Serialize, Deserialize)]
struct StoredPoint {
    timestamp_millis: i64,
    data: Bytes,
}

/// Series of timestamped entries over a [`Store`] and an [`OrderedIndex`].
///
/// Timestamps are kept at millisecond precision; finer parts are dropped.
#[derive(Clone)]
pub struct TimeSeries {
    store: Store,
    index: Arc<dyn OrderedIndex>,
}

impl TimeSeries {
    /// Creates a time series family over `store`, ordered by `index`.
    pub fn new(store: Store, index: Arc<dyn OrderedIndex>) -> Self {
        Self { store, index }
    }

    /// Writes `data` for `id` at `timestamp`, moving the entry if it already
    /// exists at another time.
    pub async fn add_or_update(
        &self,
        series_id: &str,
        id: &str,
        timestamp: DateTime<Utc>,
        data: Bytes,
    ) -> StorageResult<()> {
        let point = StoredPoint { timestamp_millis: timestamp.timestamp_millis(), data };
        let value = rmp_serde::to_vec_named(&point)
            .map_err(|e| StorageError::serialization_with_source("encoding series point", e))?;
        let key = keys::series_entry_key(series_id, id);
        if self.store.set(Entry::new(key, value), &uncancellable()).await?.is_none() {
            return Err(StorageError::internal(format!(
                "series {series_id}: write of {id} was rejected"
            )));
        }
        self.index.upsert(&keys::series_index(series_id), id, &encode_timestamp(timestamp)).await
    }

    /// Reads the entry `id`.
    pub async fn get(&self, series_id: &str, id: &str) -> StorageResult<Option<TimeSeriesEntry>> {
        let key = keys::series_entry_key(series_id, id);
        let Some(Entry { value: Some(value), .. }) = self.store.get(&key, &uncancellable()).await?
        else {
            return Ok(None);
        };
        let point: StoredPoint = rmp_serde::from_slice(&value)
            .map_err(|e| StorageError::serialization_with_source("decoding series point", e))?;
        let timestamp = DateTime::from_timestamp_millis(point.timestamp_millis)
            .ok_or_else(|| StorageError::serialization("series point timestamp out of range"))?;
        Ok(Some(TimeSeriesEntry { id: id.to_owned(), timestamp, data: point.data }))
    }

    /// Entries with `from <= timestamp <= to`, oldest first.
    ///
    /// Index members whose payload has vanished are removed from the index
    /// and left out of the result.
    pub async fn get_range(
        &self,
        series_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<TimeSeriesEntry>> {
        let index = keys::series_index(series_id);
        let members =
            self.index.range(&index, &encode_timestamp(from), &encode_timestamp(to)).await?;
        let mut entries = Vec::with_capacity(members.len());
        for (id, _) in members {
            match self.get(series_id, &id).await? {
                Some(entry) => entries.push(entry),
                None => {
                    debug!(series = series_id, id = %id, "pruning index member without payload");
                    self.index.remove(&index, &id).await?;
                },
            }
        }
        Ok(entries)
    }

    /// Removes `id` from the index and deletes its payload. Returns `true`
    /// if either existed.
    pub async fn remove(&self, series_id: &str, id: &str) -> StorageResult<bool> {
        let indexed = self.index.remove(&keys::series_index(series_id), id).await?;
        let key = keys::series_entry_key(series_id, id);
        let stored = self.store.delete(&key, "", &uncancellable()).await?;
        Ok(indexed || stored)
    }
}
