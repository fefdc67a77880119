//! Append-only versioned event streams over the primitive contract.
//!
//! A stream is an [`EventStoreState`] record plus one entry per retained
//! event, keyed by event number. Event numbers start at `0`; a stream that
//! has never been written is at version `-1`. The retained window is the last
//! `count` event numbers ending at `version`, which is shorter than the full
//! history once a maximum event count trims old events.
//!
//! Writers assert an [`ExpectedVersion`]; a mismatch fails with
//! [`StorageError::WrongExpectedVersion`] and leaves the stream untouched.
//!
//! Like the queue, every mutation is one isolated read-modify-persist step
//! keyed by stream id.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use stowage_storage::{
    Entry, ExpectedVersionKind, Handler, KeyedOperation, Operation, Pipeline, StorageError,
    StorageResult, Store,
    behaviors::{ExclusiveExecutor, LocalExecutor},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    isolated, keys,
    record::{self, uncancellable},
};

/// The version a writer asserts before appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check.
    Any,
    /// The stream must have been written before.
    StreamExists,
    /// The stream must be at exactly this version; `-1` means never written.
    Exact(i64),
}

impl From<i64> for ExpectedVersion {
    fn from(version: i64) -> Self {
        Self::Exact(version)
    }
}

/// An inclusive range of event numbers written by one append.
///
/// An append of zero events yields the empty range `[version + 1, version]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    /// First event number written.
    pub begin: i64,
    /// Last event number written.
    pub end: i64,
}

impl VersionRange {
    /// Returns `true` when no event was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.begin > self.end
    }

    /// Number of events in the range.
    #[must_use]
    pub fn len(&self) -> i64 {
        (self.end - self.begin + 1).max(0)
    }
}

/// Which events a read covers, resolved against the retained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRange {
    /// Every retained event.
    All,
    /// Events numbered `n` and later.
    From(i64),
    /// Events numbered `a` through `b`, inclusive.
    Between(i64, i64),
    /// The latest `n` events.
    Last(i64),
    /// The single event numbered `n`.
    Single(i64),
}

impl EventRange {
    /// Resolves the range to inclusive event numbers within the retained
    /// window, or `None` when nothing can match.
    fn resolve(self, state: &EventStoreState) -> Option<(i64, i64)> {
        if state.version < 0 || state.count <= 0 {
            return None;
        }
        let last = state.version;
        let first = state.first_retained();
        let (start, end) = match self {
            Self::All => (first, last),
            Self::From(n) if n >= 0 => (n, last),
            Self::Between(a, b) if a >= 0 && a <= b => (a, b),
            Self::Last(n) if n > 0 => (last.saturating_sub(n - 1), last),
            Self::Single(n) if n >= 0 => (n, n),
            _ => return None,
        };
        let (start, end) = (start.max(first), end.min(last));
        (start <= end).then_some((start, end))
    }
}

/// An event to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Application-defined event type.
    pub event_type: String,
    /// Opaque payload.
    pub data: Bytes,
}

impl NewEvent {
    /// Creates an event of `event_type` carrying `data`.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self { event_type: event_type.into(), data: data.into() }
    }
}

/// An event as stored in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// The stream the event belongs to.
    pub stream_id: String,
    /// The version the event was written at.
    pub event_number: i64,
    /// When the event was appended.
    pub created_at: DateTime<Utc>,
    /// Application-defined event type.
    pub event_type: String,
    /// Opaque payload.
    pub data: Bytes,
}

impl RecordedEvent {
    fn encode(&self) -> StorageResult<Vec<u8>> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| StorageError::serialization_with_source("encoding recorded event", e))
    }

    fn decode(bytes: &[u8]) -> StorageResult<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| StorageError::serialization_with_source("decoding recorded event", e))
    }
}

/// Persisted bookkeeping of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStoreState {
    /// Number of the latest event; `-1` when never written.
    pub version: i64,
    /// Number of retained events.
    pub count: i64,
    /// Retention cap; `0` keeps everything.
    pub maximum_event_count: i64,
    /// Time-to-live applied to each appended event; `0` disables expiry.
    pub expires_in_seconds: i64,
    /// Events created before this instant are hidden; when it lies in the
    /// future the whole stream reads as empty. `0` disables the horizon.
    pub delete_before_unix_time_milliseconds: i64,
    /// When the state record was first created.
    pub created_at: DateTime<Utc>,
    /// When the state record was last written.
    pub updated_at: DateTime<Utc>,
}

impl EventStoreState {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            version: -1,
            count: 0,
            maximum_event_count: 0,
            expires_in_seconds: 0,
            delete_before_unix_time_milliseconds: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if the stream has been written.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.version >= 0
    }

    fn first_retained(&self) -> i64 {
        (self.version - self.count + 1).max(0)
    }

    /// Lowers `count` to the retention cap, returning the event numbers that
    /// fell out of the window.
    fn trim(&mut self) -> std::ops::Range<i64> {
        if self.maximum_event_count <= 0 || self.count <= self.maximum_event_count {
            return 0..0;
        }
        let first = self.first_retained();
        let excess = self.count - self.maximum_event_count;
        self.count = self.maximum_event_count;
        first..first + excess
    }
}

/// Caller-facing view of a stream's retention settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Time-to-live for events appended from now on.
    #[serde(default, with = "humantime_serde")]
    pub expires_in: Option<Duration>,
    /// Retain at most this many events.
    #[serde(default)]
    pub maximum_event_count: Option<u64>,
    /// Hide events created before this instant.
    #[serde(default)]
    pub delete_before: Option<DateTime<Utc>>,
}

impl StreamOptions {
    fn from_state(state: &EventStoreState) -> Self {
        Self {
            expires_in: u64::try_from(state.expires_in_seconds)
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            maximum_event_count: u64::try_from(state.maximum_event_count)
                .ok()
                .filter(|max| *max > 0),
            delete_before: match state.delete_before_unix_time_milliseconds {
                0 => None,
                millis => DateTime::from_timestamp_millis(millis),
            },
        }
    }

    fn apply_to(&self, state: &mut EventStoreState) {
        state.expires_in_seconds = self
            .expires_in
            .map_or(0, |ttl| i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
        state.maximum_event_count = self
            .maximum_event_count
            .map_or(0, |max| i64::try_from(max).unwrap_or(i64::MAX));
        state.delete_before_unix_time_milliseconds =
            self.delete_before.map_or(0, |at| at.timestamp_millis());
    }
}

/// Append `events` after checking `expected`; yields the range written.
#[derive(Debug, Clone)]
pub struct AppendEvents {
    /// Target stream.
    pub stream_id: String,
    /// Version assertion.
    pub expected: ExpectedVersion,
    /// Events to write, in order.
    pub events: Vec<NewEvent>,
}

/// Remove every retained event and the state record; yields `true` if the
/// stream existed.
#[derive(Debug, Clone)]
pub struct DeleteStream {
    /// Target stream.
    pub stream_id: String,
}

/// Read a stream's state; a stream never written reports version `-1`.
#[derive(Debug, Clone)]
pub struct StreamStateRequest {
    /// Target stream.
    pub stream_id: String,
}

/// Overwrite a stream's state record.
#[derive(Debug, Clone)]
pub struct SetStreamState {
    /// Target stream.
    pub stream_id: String,
    /// The replacement state.
    pub state: EventStoreState,
}

/// Apply retention settings, trimming at once if the new cap requires it;
/// yields the new state.
#[derive(Debug, Clone)]
pub struct SetStreamOptions {
    /// Target stream.
    pub stream_id: String,
    /// The settings to apply.
    pub options: StreamOptions,
}

macro_rules! stream_operation {
    ($op:ty, $output:ty, $name:literal) => {
        impl Operation for $op {
            type Output = $output;
            const NAME: &'static str = $name;
        }

        impl KeyedOperation for $op {
            fn key(&self) -> &str {
                &self.stream_id
            }
        }
    };
}

stream_operation!(AppendEvents, VersionRange, "event_store.append");
stream_operation!(DeleteStream, bool, "event_store.delete");
stream_operation!(StreamStateRequest, EventStoreState, "event_store.state");
stream_operation!(SetStreamState, (), "event_store.set_state");
stream_operation!(SetStreamOptions, EventStoreState, "event_store.set_options");

#[derive(Clone)]
struct StreamEngine {
    store: Store,
}

impl StreamEngine {
    async fn load(&self, stream_id: &str) -> StorageResult<Option<EventStoreState>> {
        record::load(&self.store, &keys::stream_state_key(stream_id)).await
    }

    async fn state(&self, stream_id: &str) -> StorageResult<EventStoreState> {
        Ok(self.load(stream_id).await?.unwrap_or_else(EventStoreState::fresh))
    }

    async fn persist(&self, stream_id: &str, state: &EventStoreState) -> StorageResult<()> {
        record::save(&self.store, &keys::stream_state_key(stream_id), state).await
    }

    async fn read_event(
        &self,
        stream_id: &str,
        event_number: i64,
    ) -> StorageResult<Option<RecordedEvent>> {
        let key = keys::event_key(stream_id, event_number);
        match self.store.get(&key, &uncancellable()).await? {
            Some(Entry { value: Some(value), .. }) => RecordedEvent::decode(&value).map(Some),
            _ => Ok(None),
        }
    }

    /// Deletes events that fell out of the retained window. The window has
    /// already been persisted, so a failure only leaves unreachable entries.
    async fn discard(&self, stream_id: &str, numbers: std::ops::Range<i64>) {
        for event_number in numbers {
            let key = keys::event_key(stream_id, event_number);
            if let Err(err) = self.store.delete(&key, "", &uncancellable()).await {
                warn!(
                    stream = stream_id,
                    event_number,
                    error = %err,
                    "trimmed event delete failed"
                );
            }
        }
    }
}

fn check_expected(
    stream_id: &str,
    expected: ExpectedVersion,
    state: &EventStoreState,
) -> StorageResult<()> {
    let kind = match expected {
        ExpectedVersion::Any => return Ok(()),
        ExpectedVersion::StreamExists if state.exists() => return Ok(()),
        ExpectedVersion::Exact(version) if version == state.version => return Ok(()),
        ExpectedVersion::StreamExists => ExpectedVersionKind::StreamExists,
        ExpectedVersion::Exact(version) => ExpectedVersionKind::Exact(version),
    };
    debug!(stream = stream_id, expected = %kind, actual = state.version, "version mismatch");
    Err(StorageError::wrong_expected_version(stream_id, kind, state.version))
}

#[async_trait]
impl Handler<AppendEvents> for StreamEngine {
    async fn handle(
        &self,
        request: AppendEvents,
        _cancel: &CancellationToken,
    ) -> StorageResult<VersionRange> {
        let AppendEvents { stream_id, expected, events } = request;
        let mut state = self.state(&stream_id).await?;
        check_expected(&stream_id, expected, &state)?;

        let begin = state.version + 1;
        if events.is_empty() {
            return Ok(VersionRange { begin, end: state.version });
        }

        let now = Utc::now();
        for (event_number, event) in (begin..).zip(events) {
            let recorded = RecordedEvent {
                stream_id: stream_id.clone(),
                event_number,
                created_at: now,
                event_type: event.event_type,
                data: event.data,
            };
            let key = keys::event_key(&stream_id, event_number);
            let entry =
                Entry::new(key, recorded.encode()?).with_expires_in(state.expires_in_seconds);
            if self.store.set(entry, &uncancellable()).await?.is_none() {
                return Err(StorageError::internal(format!(
                    "stream {stream_id}: write of event {event_number} was rejected"
                )));
            }
            state.version = event_number;
            state.count += 1;
        }
        state.updated_at = now;
        let trimmed = state.trim();
        self.persist(&stream_id, &state).await?;
        self.discard(&stream_id, trimmed).await;

        Ok(VersionRange { begin, end: state.version })
    }
}

#[async_trait]
impl Handler<DeleteStream> for StreamEngine {
    async fn handle(
        &self,
        request: DeleteStream,
        _cancel: &CancellationToken,
    ) -> StorageResult<bool> {
        let stream_id = request.stream_id;
        let Some(state) = self.load(&stream_id).await? else {
            return Ok(false);
        };
        if !state.exists() {
            return Ok(false);
        }

        let mut count = state.count;
        if count > state.version + 1 || count < 0 {
            warn!(
                stream = %stream_id,
                count,
                version = state.version,
                "stream count diverged from its version; deleting the full history"
            );
            count = state.version + 1;
        }
        let mut event_number = state.version;
        for _ in 0..count {
            let key = keys::event_key(&stream_id, event_number);
            self.store.delete(&key, "", &uncancellable()).await?;
            event_number -= 1;
        }
        self.store.delete(&keys::stream_state_key(&stream_id), "", &uncancellable()).await?;
        Ok(true)
    }
}

#[async_trait]
impl Handler<StreamStateRequest> for StreamEngine {
    async fn handle(
        &self,
        request: StreamStateRequest,
        _cancel: &CancellationToken,
    ) -> StorageResult<EventStoreState> {
        self.state(&request.stream_id).await
    }
}

#[async_trait]
impl Handler<SetStreamState> for StreamEngine {
    async fn handle(
        &self,
        request: SetStreamState,
        _cancel: &CancellationToken,
    ) -> StorageResult<()> {
        self.persist(&request.stream_id, &request.state).await
    }
}

#[async_trait]
impl Handler<SetStreamOptions> for StreamEngine {
    async fn handle(
        &self,
        request: SetStreamOptions,
        _cancel: &CancellationToken,
    ) -> StorageResult<EventStoreState> {
        let SetStreamOptions { stream_id, options } = request;
        let mut state = self.state(&stream_id).await?;
        options.apply_to(&mut state);
        state.updated_at = Utc::now();
        let trimmed = state.trim();
        self.persist(&stream_id, &state).await?;
        self.discard(&stream_id, trimmed).await;
        Ok(state)
    }
}

/// A family of event streams stored in one [`Store`].
///
/// Cheap to clone; clones share the isolation lanes.
#[derive(Clone)]
pub struct EventStore {
    engine: StreamEngine,
    append: Pipeline<AppendEvents>,
    delete: Pipeline<DeleteStream>,
    state: Pipeline<StreamStateRequest>,
    set_state: Pipeline<SetStreamState>,
    set_options: Pipeline<SetStreamOptions>,
}

impl EventStore {
    /// Streams over `store`, isolated by an in-process [`LocalExecutor`].
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self::with_executor(store, Arc::new(LocalExecutor::new()))
    }

    /// Streams over `store`, isolated by `executor`.
    #[must_use]
    pub fn with_executor(store: Store, executor: Arc<dyn ExclusiveExecutor>) -> Self {
        let engine = StreamEngine { store };
        let isolation = isolated::shared(executor);
        Self {
            append: isolated::pipeline(&engine, &isolation),
            delete: isolated::pipeline(&engine, &isolation),
            state: isolated::pipeline(&engine, &isolation),
            set_state: isolated::pipeline(&engine, &isolation),
            set_options: isolated::pipeline(&engine, &isolation),
            engine,
        }
    }

    /// Appends `events` to `stream_id` if the stream satisfies `expected`.
    ///
    /// Returns the inclusive range of event numbers written. An empty batch
    /// is still checked against `expected` but writes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::WrongExpectedVersion`] on a version mismatch;
    /// the stream is left unchanged.
    #[tracing::instrument(skip(self, events, cancel), fields(events = events.len()))]
    pub async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
        cancel: &CancellationToken,
    ) -> StorageResult<VersionRange> {
        let request = AppendEvents { stream_id: stream_id.to_owned(), expected, events };
        self.append.execute(request, cancel).await
    }

    /// Deletes every retained event and the state record. A stream that was
    /// never written is left alone and reports `false`.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn delete(&self, stream_id: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        self.delete.execute(DeleteStream { stream_id: stream_id.to_owned() }, cancel).await
    }

    /// Returns the stream's state.
    pub async fn state(
        &self,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<EventStoreState> {
        self.state.execute(StreamStateRequest { stream_id: stream_id.to_owned() }, cancel).await
    }

    /// Replaces the stream's state record.
    pub async fn set_state(
        &self,
        stream_id: &str,
        state: EventStoreState,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let request = SetStreamState { stream_id: stream_id.to_owned(), state };
        self.set_state.execute(request, cancel).await
    }

    /// Returns the stream's retention settings.
    pub async fn options(
        &self,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<StreamOptions> {
        Ok(StreamOptions::from_state(&self.state(stream_id, cancel).await?))
    }

    /// Applies retention settings.
    pub async fn set_options(
        &self,
        stream_id: &str,
        options: StreamOptions,
        cancel: &CancellationToken,
    ) -> StorageResult<EventStoreState> {
        let request = SetStreamOptions { stream_id: stream_id.to_owned(), options };
        self.set_options.execute(request, cancel).await
    }

    /// Streams the events in `range` in ascending order.
    ///
    /// The range is resolved against the state read when the stream is first
    /// polled. Expired or missing events are skipped.
    pub fn get(
        &self,
        stream_id: &str,
        range: EventRange,
        cancel: &CancellationToken,
    ) -> BoxStream<'static, StorageResult<RecordedEvent>> {
        self.read(stream_id, range, false, cancel)
    }

    /// Streams the events in `range` in descending order.
    pub fn get_reverse(
        &self,
        stream_id: &str,
        range: EventRange,
        cancel: &CancellationToken,
    ) -> BoxStream<'static, StorageResult<RecordedEvent>> {
        self.read(stream_id, range, true, cancel)
    }

    fn read(
        &self,
        stream_id: &str,
        range: EventRange,
        reverse: bool,
        cancel: &CancellationToken,
    ) -> BoxStream<'static, StorageResult<RecordedEvent>> {
        let read = Read {
            events: self.clone(),
            stream_id: stream_id.to_owned(),
            range,
            reverse,
            cancel: cancel.clone(),
            window: None,
            done: false,
        };
        stream::unfold(read, |mut read| async move {
            let event = read.step().await?;
            Some((event, read))
        })
        .boxed()
    }
}

struct Read {
    events: EventStore,
    stream_id: String,
    range: EventRange,
    reverse: bool,
    cancel: CancellationToken,
    /// Remaining inclusive event numbers and the watermark in milliseconds.
    window: Option<(i64, i64, i64)>,
    done: bool,
}

impl Read {
    async fn step(&mut self) -> Option<StorageResult<RecordedEvent>> {
        if self.done {
            return None;
        }
        let result = self.advance().await;
        if !matches!(result, Some(Ok(_))) {
            self.done = true;
        }
        result
    }

    async fn advance(&mut self) -> Option<StorageResult<RecordedEvent>> {
        if self.cancel.is_cancelled() {
            return Some(Err(StorageError::Cancelled));
        }
        let (mut low, mut high, watermark) = match self.window {
            Some(window) => window,
            None => {
                let state = match self.events.state(&self.stream_id, &self.cancel).await {
                    Ok(state) => state,
                    Err(err) => return Some(Err(err)),
                };
                let watermark = state.delete_before_unix_time_milliseconds;
                if watermark > Utc::now().timestamp_millis() {
                    return None;
                }
                let (low, high) = self.range.resolve(&state)?;
                (low, high, watermark)
            },
        };
        while low <= high {
            let event_number = if self.reverse {
                high -= 1;
                high + 1
            } else {
                low += 1;
                low - 1
            };
            self.window = Some((low, high, watermark));
            match self.events.engine.read_event(&self.stream_id, event_number).await {
                Ok(Some(event)) if event.created_at.timestamp_millis() >= watermark => {
                    return Some(Ok(event));
                },
                Ok(_) => {},
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use futures::TryStreamExt;
    use stowage_storage::{MemoryBackend, StorageBackend};

    use super::*;

    fn events() -> (MemoryBackend, EventStore) {
        let backend = MemoryBackend::new();
        let events = EventStore::new(Store::builder(backend.clone()).build());
        (backend, events)
    }

    fn batch(n: usize) -> Vec<NewEvent> {
        (0..n).map(|i| NewEvent::new("tick", format!("e{i}"))).collect()
    }

    async fn numbers(stream: BoxStream<'static, StorageResult<RecordedEvent>>) -> Vec<i64> {
        stream.map_ok(|event| event.event_number).try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn fresh_stream_reports_never_written() {
        let (_, events) = events();
        let cancel = CancellationToken::new();
        let state = events.state("s", &cancel).await.unwrap();
        assert_eq!(state.version, -1);
        assert!(!state.exists());
        assert!(numbers(events.get("s", EventRange::All, &cancel)).await.is_empty());
        assert!(!events.delete("s", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn append_writes_consecutive_numbers() {
        let (_, events) = events();
        let cancel = CancellationToken::new();
        let range = events.append("s", ExpectedVersion::Any, batch(3), &cancel).await.unwrap();
        assert_eq!(range, VersionRange { begin: 0, end: 2 });
        assert_eq!(range.len(), 3);

        let recorded: Vec<_> =
            events.get("s", EventRange::All, &cancel).try_collect().await.unwrap();
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[1].stream_id, "s");
        assert_eq!(recorded[1].data, Bytes::from("e1"));
        assert_eq!(numbers(events.get_reverse("s", EventRange::All, &cancel)).await, [2, 1, 0]);
    }

    #[tokio::test]
    async fn stream_exists_requires_a_prior_write() {
        let (_, events) = events();
        let cancel = CancellationToken::new();
        let err = events
            .append("s", ExpectedVersion::StreamExists, batch(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::WrongExpectedVersion {
                expected: ExpectedVersionKind::StreamExists,
                actual: -1,
                ..
            }
        ));

        events.append("s", ExpectedVersion::Exact(-1), batch(1), &cancel).await.unwrap();
        events.append("s", ExpectedVersion::StreamExists, batch(1), &cancel).await.unwrap();
        assert_eq!(events.state("s", &cancel).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let (backend, events) = events();
        let cancel = CancellationToken::new();
        let range = events.append("s", ExpectedVersion::Any, Vec::new(), &cancel).await.unwrap();
        assert_eq!(range, VersionRange { begin: 0, end: -1 });
        assert!(range.is_empty());
        assert!(backend.is_empty());

        let err =
            events.append("s", ExpectedVersion::Exact(3), Vec::new(), &cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::WrongExpectedVersion { .. }));
    }

    #[rstest::rstest]
    #[case::all(EventRange::All, vec![0, 1, 2, 3, 4])]
    #[case::from(EventRange::From(3), vec![3, 4])]
    #[case::from_past_end(EventRange::From(9), vec![])]
    #[case::from_negative(EventRange::From(-1), vec![])]
    #[case::between(EventRange::Between(1, 3), vec![1, 2, 3])]
    #[case::between_clamped(EventRange::Between(3, 99), vec![3, 4])]
    #[case::between_inverted(EventRange::Between(3, 1), vec![])]
    #[case::last(EventRange::Last(2), vec![3, 4])]
    #[case::last_more_than_stored(EventRange::Last(50), vec![0, 1, 2, 3, 4])]
    #[case::last_zero(EventRange::Last(0), vec![])]
    #[case::single(EventRange::Single(2), vec![2])]
    #[case::single_missing(EventRange::Single(7), vec![])]
    #[tokio::test]
    async fn ranges_resolve_against_the_stream(#[case] range: EventRange, #[case] want: Vec<i64>) {
        let (_, events) = events();
        let cancel = CancellationToken::new();
        events.append("s", ExpectedVersion::Any, batch(5), &cancel).await.unwrap();
        assert_eq!(numbers(events.get("s", range, &cancel)).await, want);
    }

    #[tokio::test]
    async fn maximum_event_count_trims_the_oldest_events() {
        let (backend, events) = events();
        let cancel = CancellationToken::new();
        let options = StreamOptions { maximum_event_count: Some(3), ..StreamOptions::default() };
        events.set_options("s", options, &cancel).await.unwrap();
        events.append("s", ExpectedVersion::Any, batch(5), &cancel).await.unwrap();

        let state = events.state("s", &cancel).await.unwrap();
        assert_eq!((state.version, state.count), (4, 3));
        assert_eq!(numbers(events.get("s", EventRange::All, &cancel)).await, [2, 3, 4]);
        assert!(!backend.keys().contains(&keys::event_key("s", 1)));
        assert_eq!(events.options("s", &cancel).await.unwrap(), options);
    }

    #[tokio::test]
    async fn lowering_the_cap_trims_immediately() {
        let (_, events) = events();
        let cancel = CancellationToken::new();
        events.append("s", ExpectedVersion::Any, batch(4), &cancel).await.unwrap();
        let options = StreamOptions { maximum_event_count: Some(1), ..StreamOptions::default() };
        let state = events.set_options("s", options, &cancel).await.unwrap();
        assert_eq!(state.count, 1);
        assert_eq!(numbers(events.get("s", EventRange::All, &cancel)).await, [3]);
    }

    #[tokio::test]
    async fn stream_ttl_is_applied_to_each_event() {
        let (backend, events) = events();
        let cancel = CancellationToken::new();
        let options =
            StreamOptions { expires_in: Some(Duration::from_secs(60)), ..StreamOptions::default() };
        events.set_options("s", options, &cancel).await.unwrap();
        events.append("s", ExpectedVersion::Any, batch(1), &cancel).await.unwrap();

        let entry = backend.get(&keys::event_key("s", 0)).await.unwrap().unwrap();
        assert_eq!(entry.expires_in_seconds, 60);
        assert!(entry.expires_at_unix_seconds > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn future_watermark_hides_the_whole_stream() {
        let (_, events) = events();
        let cancel = CancellationToken::new();
        events.append("s", ExpectedVersion::Any, batch(2), &cancel).await.unwrap();
        let options = StreamOptions {
            delete_before: Some(Utc::now() + chrono::Duration::hours(1)),
            ..StreamOptions::default()
        };
        events.set_options("s", options, &cancel).await.unwrap();
        assert!(numbers(events.get("s", EventRange::All, &cancel)).await.is_empty());
    }

    #[tokio::test]
    async fn past_watermark_hides_older_events() {
        let (_, events) = events();
        let cancel = CancellationToken::new();
        events.append("s", ExpectedVersion::Any, batch(1), &cancel).await.unwrap();
        let first = events.get("s", EventRange::Single(0), &cancel).next().await.unwrap().unwrap();

        let horizon = first.created_at + chrono::Duration::milliseconds(1);
        let options = StreamOptions { delete_before: Some(horizon), ..StreamOptions::default() };
        events.set_options("s", options, &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        events.append("s", ExpectedVersion::Any, batch(1), &cancel).await.unwrap();

        assert_eq!(numbers(events.get("s", EventRange::All, &cancel)).await, [1]);
    }

    #[tokio::test]
    async fn delete_resets_to_never_written() {
        let (backend, events) = events();
        let cancel = CancellationToken::new();
        events.append("s", ExpectedVersion::Any, batch(3), &cancel).await.unwrap();

        assert!(events.delete("s", &cancel).await.unwrap());
        assert!(backend.is_empty());
        assert_eq!(events.state("s", &cancel).await.unwrap().version, -1);
        let range = events.append("s", ExpectedVersion::Exact(-1), batch(1), &cancel).await;
        assert_eq!(range.unwrap(), VersionRange { begin: 0, end: 0 });
    }

    #[tokio::test]
    async fn delete_clamps_a_diverged_count() {
        let (backend, events) = events();
        let cancel = CancellationToken::new();
        events.append("s", ExpectedVersion::Any, batch(2), &cancel).await.unwrap();
        let mut state = events.state("s", &cancel).await.unwrap();
        state.count = 10;
        events.set_state("s", state, &cancel).await.unwrap();

        assert!(events.delete("s", &cancel).await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn expired_or_missing_events_are_skipped() {
        let (backend, events) = events();
        let cancel = CancellationToken::new();
        events.append("s", ExpectedVersion::Any, batch(3), &cancel).await.unwrap();
        backend.delete(&keys::event_key("s", 1), "").await.unwrap();

        assert_eq!(numbers(events.get("s", EventRange::All, &cancel)).await, [0, 2]);
    }
}
