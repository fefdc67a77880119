//! Shared test utilities for stores, behaviors and backends.
//!
//! This module provides helpers for generating test data, backends that fail
//! on demand, a scheduler that records instead of firing, and assertion
//! macros for [`StorageResult`] values. It is feature-gated behind `testutil`
//! to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! stowage-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use stowage_storage::testutil::{FailingBackend, FailureMode, make_key, make_value};
//! ```

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    scheduler::{Dispatch, Scheduler},
    types::{Entry, Features},
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"` (zero-padded to 6 digits). The
/// zero-padding keeps lexicographic order equal to numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> String {
    format!("{prefix}:{idx:06}")
}

/// Create a test value of the given size filled with `0xAB` bytes.
#[must_use]
pub fn make_value(size: usize) -> Bytes {
    Bytes::from(vec![0xAB; size])
}

/// Create a test value tagged with a task ID and sequence number.
///
/// Produces values like `"task3-val42"`, useful for concurrent tests that
/// need to tell which task wrote which value.
#[must_use]
pub fn make_tagged_value(task: usize, seq: usize) -> Bytes {
    Bytes::from(format!("task{task}-val{seq}"))
}

/// Create a [`MemoryBackend`] pre-populated with `count` keys.
///
/// # Panics
///
/// Panics if any `set` operation fails (should not happen with `MemoryBackend`).
pub async fn populated_backend(prefix: &str, count: usize, value_size: usize) -> MemoryBackend {
    let backend = MemoryBackend::new();
    let value = make_value(value_size);
    for i in 0..count {
        backend
            .set(Entry::new(make_key(prefix, i), value.clone()))
            .await
            .expect("populate set failed");
    }
    backend
}

/// How a [`FailingBackend`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Never fails; the wrapper only counts calls.
    Never,
    /// The first `n` calls fail with a transient connection error.
    Transient(usize),
    /// Every call fails with a transient connection error.
    Always,
    /// Every call fails with a non-transient internal error.
    Permanent,
}

/// Wraps a backend, failing data calls according to a [`FailureMode`].
///
/// `set`, `get`, `delete` and `clear` are counted and may fail; `features`
/// always passes through.
#[derive(Clone)]
pub struct FailingBackend<B = MemoryBackend> {
    inner: B,
    mode: FailureMode,
    calls: Arc<AtomicUsize>,
}

impl<B: StorageBackend> FailingBackend<B> {
    /// Wraps `inner`.
    pub fn new(inner: B, mode: FailureMode) -> Self {
        Self { inner, mode, calls: Arc::new(AtomicUsize::new(0)) }
    }

    /// Data calls received so far, failed ones included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn check(&self, operation: &str) -> StorageResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.mode {
            FailureMode::Never => Ok(()),
            FailureMode::Transient(n) if call > n => Ok(()),
            FailureMode::Transient(_) | FailureMode::Always => {
                Err(StorageError::connection(format!("injected {operation} failure #{call}")))
            },
            FailureMode::Permanent => {
                Err(StorageError::internal(format!("injected permanent {operation} failure")))
            },
        }
    }
}

#[async_trait]
impl<B: StorageBackend> StorageBackend for FailingBackend<B> {
    async fn features(&self) -> StorageResult<Features> {
        self.inner.features().await
    }

    async fn set(&self, entry: Entry) -> StorageResult<Option<String>> {
        self.check("set")?;
        self.inner.set(entry).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Entry>> {
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str, etag: &str) -> StorageResult<bool> {
        self.check("delete")?;
        self.inner.delete(key, etag).await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.check("clear")?;
        self.inner.clear().await
    }
}

/// A notification held by a [`RecordingScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledNotice {
    /// The payload to deliver.
    pub payload: Bytes,
    /// Delay requested at scheduling time.
    pub trigger_in: Duration,
    /// Repeat interval, if any.
    pub repeat_every: Option<Duration>,
}

/// [`Scheduler`] that records notifications and fires them only on request.
#[derive(Default)]
pub struct RecordingScheduler {
    notices: Mutex<BTreeMap<String, ScheduledNotice>>,
}

impl RecordingScheduler {
    /// The pending notification `id`, if any.
    #[must_use]
    pub fn pending(&self, id: &str) -> Option<ScheduledNotice> {
        self.notices.lock().get(id).cloned()
    }

    /// Ids of every pending notification, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.notices.lock().keys().cloned().collect()
    }

    /// Delivers every pending notification through `dispatch`, removing the
    /// one-shot ones. Returns the number delivered.
    pub async fn fire_all(&self, dispatch: &dyn Dispatch) -> StorageResult<usize> {
        let due: Vec<_> = self
            .notices
            .lock()
            .iter()
            .map(|(id, notice)| (id.clone(), notice.clone()))
            .collect();
        for (id, notice) in &due {
            if notice.repeat_every.is_none() {
                self.notices.lock().remove(id);
            }
            dispatch.dispatch(id, notice.payload.clone()).await?;
        }
        Ok(due.len())
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn schedule(
        &self,
        id: &str,
        payload: Bytes,
        trigger_in: Duration,
        repeat_every: Option<Duration>,
    ) -> StorageResult<()> {
        self.notices
            .lock()
            .insert(id.to_owned(), ScheduledNotice { payload, trigger_in, repeat_every });
        Ok(())
    }

    async fn cancel(&self, id: &str) -> StorageResult<()> {
        self.notices.lock().remove(id);
        Ok(())
    }
}

/// Assert that a [`StorageResult`] is `Ok`.
///
/// Returns the inner value on success, panics with a descriptive message
/// on failure.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use stowage_storage::{StorageResult, assert_storage_ok};
///
/// let result: StorageResult<i32> = Ok(42);
/// let value = assert_storage_ok!(result);
/// assert_eq!(value, 42);
/// ```
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StorageError: {e:?}", $msg),
        }
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::Cancelled`].
#[macro_export]
macro_rules! assert_cancelled {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Cancelled)),
            "expected StorageError::Cancelled, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::InvalidKey`].
#[macro_export]
macro_rules! assert_invalid_key {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::InvalidKey { .. })),
            "expected StorageError::InvalidKey, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is a
/// [`StorageError::WrongExpectedVersion`] reporting `actual`.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use stowage_storage::{
///     ExpectedVersionKind, StorageError, StorageResult, assert_wrong_expected_version,
/// };
///
/// let result: StorageResult<()> =
///     Err(StorageError::wrong_expected_version("s", ExpectedVersionKind::StreamExists, -1));
/// assert_wrong_expected_version!(result, -1);
/// ```
#[macro_export]
macro_rules! assert_wrong_expected_version {
    ($result:expr, $actual:expr) => {
        match &$result {
            Err($crate::error::StorageError::WrongExpectedVersion { actual, .. }) => {
                assert_eq!(*actual, $actual, "unexpected actual version");
            },
            other => panic!("expected StorageError::WrongExpectedVersion, got: {other:?}"),
        }
    };
}

/// Helper to verify that a result is a `Cancelled` error.
pub fn is_cancelled<T>(result: &StorageResult<T>) -> bool {
    matches!(result, Err(StorageError::Cancelled))
}

/// Helper to verify that a result is a `Closed` error.
pub fn is_closed<T>(result: &StorageResult<T>) -> bool {
    matches!(result, Err(StorageError::Closed { .. }))
}
