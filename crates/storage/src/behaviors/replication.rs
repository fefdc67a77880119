//! Write-ahead replication through a durable log.
//!
//! [`ReplicationBehavior`] turns each `set` and `delete` into a
//! [`TransactionRecord`], appends it to a [`DurableLog`] and answers the caller
//! only after a background replayer has read the record back and applied it
//! through the store. Every writer, local or remote, applies mutations in log
//! order.
//!
//! The replayer re-enters the store it was started with. Replayed requests
//! carry the [`REPLAY_MARKER`] header so this behavior lets them through to
//! the rest of the pipeline; reads strip the header again. Records are
//! numbered per writer and a record whose sequence was already applied is
//! skipped, which absorbs the log's at-least-once delivery.
//!
//! Register this behavior outermost. The replayer holds a clone of the store,
//! so call [`ReplicationBehavior::shutdown`] to release it.
//!
//! ```text
//! caller ─▶ replication ─▶ log.write ─▶ (wait)
//!                              │
//!                replayer ◀────┘ ─▶ store (marked) ─▶ replication (pass) ─▶ backend
//! ```

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::{Notify, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{ConfigError, StorageError, StorageResult},
    log::DurableLog,
    ops::{DeleteRequest, GetRequest, SetRequest},
    pipeline::{Behavior, Next},
    store::{Layer, LayerStack, Store},
    types::{Entry, REPLAY_MARKER},
};

/// Default time [`ReplicationBehavior::shutdown`] waits for outstanding records.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Replay starting point and shutdown drain limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Log position the replayer starts reading from.
    #[serde(default)]
    start_position: u64,
    /// Upper bound on the shutdown drain.
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    drain_timeout: Duration,
}

fn default_drain_timeout() -> Duration {
    DEFAULT_DRAIN_TIMEOUT
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self { start_position: 0, drain_timeout: DEFAULT_DRAIN_TIMEOUT }
    }
}

#[bon::bon]
impl ReplicationConfig {
    /// Creates a replication configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MustBePositive`] if `drain_timeout` is zero.
    #[builder]
    pub fn new(
        #[builder(default)] start_position: u64,
        #[builder(default = DEFAULT_DRAIN_TIMEOUT)] drain_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if drain_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "drain_timeout", value: "0s".into() });
        }
        Ok(Self { start_position, drain_timeout })
    }

    /// Log position the replayer starts from.
    #[must_use]
    pub fn start_position(&self) -> u64 {
        self.start_position
    }

    /// Upper bound on the shutdown drain.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

/// A replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Write an entry, etag precondition included.
    Set(Entry),
    /// Remove a key if `etag` is empty or current.
    Delete {
        /// The key to remove.
        key: String,
        /// The precondition.
        etag: String,
    },
}

/// One log record: a mutation stamped with its writer and sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Identifies the behavior instance that wrote the record.
    pub writer_id: String,
    /// Per-writer sequence, starting at 1.
    pub seq: u64,
    /// The change to apply.
    pub mutation: Mutation,
}

impl TransactionRecord {
    /// Encodes the record for the log.
    pub fn encode(&self) -> StorageResult<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    /// Decodes a log record.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[derive(Debug)]
enum Applied {
    Set(Option<String>),
    Delete(bool),
}

type Completion = oneshot::Sender<StorageResult<Applied>>;

/// State shared between the behavior and its replayer task.
struct Shared {
    writer_id: String,
    pending: Mutex<HashMap<u64, Completion>>,
    /// Highest sequence applied per writer.
    applied_seq: Mutex<HashMap<String, u64>>,
    /// Own records applied so far.
    applied: AtomicU64,
    applied_changed: Notify,
    /// Next log position to read; the in-memory checkpoint.
    position: AtomicU64,
}

impl Shared {
    async fn apply(&self, store: &Store, position: u64, bytes: &[u8]) {
        let record = match TransactionRecord::decode(bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(position, error = %err, "skipping undecodable replication record");
                self.position.store(position + 1, Ordering::Release);
                return;
            },
        };

        let duplicate = self
            .applied_seq
            .lock()
            .get(&record.writer_id)
            .is_some_and(|&last| record.seq <= last);
        if duplicate {
            debug!(
                position,
                writer = %record.writer_id,
                seq = record.seq,
                "skipping replayed duplicate"
            );
            self.position.store(position + 1, Ordering::Release);
            return;
        }

        // Replays must complete once started; the caller may stop waiting but
        // the record is already durable.
        let uncancellable = CancellationToken::new();
        let result = match record.mutation {
            Mutation::Set(mut entry) => {
                entry.metadata.insert(REPLAY_MARKER.to_owned(), record.writer_id.clone());
                store.set(entry, &uncancellable).await.map(Applied::Set)
            },
            Mutation::Delete { key, etag } => {
                let mut request = DeleteRequest::new(key, etag);
                request.metadata.insert(REPLAY_MARKER.to_owned(), record.writer_id.clone());
                store.delete_with(request, &uncancellable).await.map(Applied::Delete)
            },
        };
        if let Err(err) = &result {
            warn!(
                position,
                writer = %record.writer_id,
                seq = record.seq,
                error = %err,
                "replay failed"
            );
        }

        self.applied_seq.lock().insert(record.writer_id.clone(), record.seq);
        self.position.store(position + 1, Ordering::Release);

        if record.writer_id == self.writer_id {
            if let Some(completion) = self.pending.lock().remove(&record.seq) {
                let _ = completion.send(result);
            }
            self.applied.fetch_add(1, Ordering::AcqRel);
            self.applied_changed.notify_waiters();
        }
    }

    async fn wait_applied(&self, target: u64) {
        loop {
            let changed = self.applied_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if self.applied.load(Ordering::Acquire) >= target {
                return;
            }
            changed.await;
        }
    }
}

struct Replayer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Replicates writes through a [`DurableLog`] before acknowledging them.
pub struct ReplicationBehavior {
    config: ReplicationConfig,
    log: Arc<dyn DurableLog>,
    shared: Arc<Shared>,
    /// Last sequence written; held across the log write so this writer's
    /// records reach the log in sequence order.
    seq: tokio::sync::Mutex<u64>,
    replayer: Mutex<Option<Replayer>>,
    closed: AtomicBool,
}

impl ReplicationBehavior {
    /// Replicates through `log` under a fresh writer id.
    pub fn new(log: Arc<dyn DurableLog>, config: ReplicationConfig) -> Self {
        let shared = Shared {
            writer_id: uuid::Uuid::new_v4().to_string(),
            pending: Mutex::new(HashMap::new()),
            applied_seq: Mutex::new(HashMap::new()),
            applied: AtomicU64::new(0),
            applied_changed: Notify::new(),
            position: AtomicU64::new(config.start_position),
        };
        Self {
            config,
            log,
            shared: Arc::new(shared),
            seq: tokio::sync::Mutex::new(0),
            replayer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// This instance's writer id.
    #[must_use]
    pub fn writer_id(&self) -> &str {
        &self.shared.writer_id
    }

    /// Next log position the replayer will read.
    #[must_use]
    pub fn checkpoint(&self) -> u64 {
        self.shared.position.load(Ordering::Acquire)
    }

    /// Starts replaying the log into `store`, which must be the store this
    /// behavior is registered on.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidArgument`] if already started and
    /// [`StorageError::Closed`] after shutdown.
    pub fn start(&self, store: Store) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::closed("replication"));
        }
        let mut replayer = self.replayer.lock();
        if replayer.is_some() {
            return Err(StorageError::invalid_argument("replication replayer already started"));
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(replay(
            Arc::clone(&self.shared),
            Arc::clone(&self.log),
            store,
            cancel.clone(),
        ));
        *replayer = Some(Replayer { cancel, task });
        Ok(())
    }

    /// Stops accepting writes, waits for every record already written to be
    /// applied (bounded by the drain timeout), then stops the replayer.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        // Taking the sequence lock waits out an in-progress log write.
        let written = *self.seq.lock().await;

        let Some(replayer) = self.replayer.lock().take() else {
            return;
        };
        if tokio::time::timeout(self.config.drain_timeout, self.shared.wait_applied(written))
            .await
            .is_err()
        {
            warn!(
                written,
                applied = self.shared.applied.load(Ordering::Acquire),
                "replication drain timed out"
            );
        }

        replayer.cancel.cancel();
        if let Err(err) = replayer.task.await {
            warn!(error = %err, "replication replayer panicked");
        }
        for (_, completion) in self.shared.pending.lock().drain() {
            let _ = completion.send(Err(StorageError::closed("replication")));
        }
    }

    async fn submit(
        &self,
        mutation: Mutation,
        cancel: &CancellationToken,
    ) -> StorageResult<Applied> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if self.closed.load(Ordering::Acquire) || self.replayer.lock().is_none() {
            return Err(StorageError::closed("replication"));
        }

        let applied = {
            let mut seq = self.seq.lock().await;
            if self.closed.load(Ordering::Acquire) {
                return Err(StorageError::closed("replication"));
            }
            let next_seq = *seq + 1;
            let record = TransactionRecord {
                writer_id: self.shared.writer_id.clone(),
                seq: next_seq,
                mutation,
            };
            let bytes = record.encode()?;

            let (tx, rx) = oneshot::channel();
            self.shared.pending.lock().insert(next_seq, tx);
            fail_point!("replication-before-log-write", |_| {
                self.shared.pending.lock().remove(&next_seq);
                Err(StorageError::connection("injected log write failure"))
            });
            if let Err(err) = self.log.write(bytes).await {
                self.shared.pending.lock().remove(&next_seq);
                return Err(err);
            }
            *seq = next_seq;
            rx
        };

        select! {
            biased;
            () = cancel.cancelled() => Err(StorageError::Cancelled),
            result = applied => result.map_err(|_| StorageError::closed("replication"))?,
        }
    }
}

async fn replay(
    shared: Arc<Shared>,
    log: Arc<dyn DurableLog>,
    store: Store,
    cancel: CancellationToken,
) {
    let from = shared.position.load(Ordering::Acquire);
    info!(writer = %shared.writer_id, from, "replication replayer started");
    let mut records = log.subscribe(from);
    loop {
        let next = select! {
            biased;
            () = cancel.cancelled() => break,
            next = records.next() => next,
        };
        match next {
            Some(Ok((position, bytes))) => shared.apply(&store, position, &bytes).await,
            Some(Err(err)) => warn!(error = %err, "replication log read failed"),
            None => break,
        }
    }
    info!(
        writer = %shared.writer_id,
        checkpoint = shared.position.load(Ordering::Acquire),
        "replication replayer stopped"
    );
}

#[async_trait]
impl Behavior<SetRequest> for ReplicationBehavior {
    async fn handle(
        &self,
        request: SetRequest,
        cancel: &CancellationToken,
        next: Next<SetRequest>,
    ) -> StorageResult<Option<String>> {
        if request.entry.is_replayed() {
            return next.run(request, cancel).await;
        }
        match self.submit(Mutation::Set(request.entry), cancel).await? {
            Applied::Set(etag) => Ok(etag),
            Applied::Delete(_) => Err(StorageError::internal("replayed delete answered a set")),
        }
    }
}

#[async_trait]
impl Behavior<DeleteRequest> for ReplicationBehavior {
    async fn handle(
        &self,
        request: DeleteRequest,
        cancel: &CancellationToken,
        next: Next<DeleteRequest>,
    ) -> StorageResult<bool> {
        if request.is_replayed() {
            return next.run(request, cancel).await;
        }
        let mutation = Mutation::Delete { key: request.key, etag: request.etag };
        match self.submit(mutation, cancel).await? {
            Applied::Delete(removed) => Ok(removed),
            Applied::Set(_) => Err(StorageError::internal("replayed set answered a delete")),
        }
    }
}

#[async_trait]
impl Behavior<GetRequest> for ReplicationBehavior {
    async fn handle(
        &self,
        request: GetRequest,
        cancel: &CancellationToken,
        next: Next<GetRequest>,
    ) -> StorageResult<Option<Entry>> {
        let mut entry = next.run(request, cancel).await?;
        if let Some(entry) = entry.as_mut() {
            entry.metadata.remove(REPLAY_MARKER);
        }
        Ok(entry)
    }
}

impl Layer for ReplicationBehavior {
    fn register(self: Arc<Self>, stack: &mut LayerStack) {
        stack.on_set(self.clone());
        stack.on_get(self.clone());
        stack.on_delete(self);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{log::MemoryLog, memory::MemoryBackend};

    fn replicated() -> (MemoryBackend, MemoryLog, Arc<ReplicationBehavior>, Store) {
        let backend = MemoryBackend::new();
        let log = MemoryLog::new();
        let behavior =
            Arc::new(ReplicationBehavior::new(Arc::new(log.clone()), ReplicationConfig::default()));
        let store = Store::builder(backend.clone()).layer(Arc::clone(&behavior)).build();
        behavior.start(store.clone()).unwrap();
        (backend, log, behavior, store)
    }

    #[tokio::test]
    async fn writes_are_logged_then_applied() {
        let (backend, log, behavior, store) = replicated();
        let cancel = CancellationToken::new();

        let etag = store.set(Entry::new("k", "v"), &cancel).await.unwrap().unwrap();
        assert_eq!(log.len(), 1);
        let entry = store.get("k", &cancel).await.unwrap().unwrap();
        assert_eq!(entry.etag, etag);
        assert!(entry.metadata.is_empty(), "replay marker is stripped on read");

        assert!(!store.delete("k", "stale", &cancel).await.unwrap());
        assert!(store.delete("k", &etag, &cancel).await.unwrap());
        assert!(backend.is_empty());
        assert_eq!(log.len(), 3);
        assert_eq!(behavior.checkpoint(), 3);
        behavior.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_records_are_skipped() {
        let (_, log, behavior, store) = replicated();
        let set = TransactionRecord {
            writer_id: "remote".into(),
            seq: 1,
            mutation: Mutation::Set(Entry::new("k", "v")),
        };
        let delete = TransactionRecord {
            writer_id: "remote".into(),
            seq: 2,
            mutation: Mutation::Delete { key: "k".into(), etag: String::new() },
        };
        log.write(set.encode().unwrap()).await.unwrap();
        log.write(delete.encode().unwrap()).await.unwrap();
        log.write(set.encode().unwrap()).await.unwrap();

        // Own writes are applied in log order, after the remote records.
        let cancel = CancellationToken::new();
        store.set(Entry::new("marker", "m"), &cancel).await.unwrap();
        assert!(store.get("k", &cancel).await.unwrap().is_none());
        behavior.shutdown().await;
    }

    #[tokio::test]
    async fn writes_before_start_are_refused() {
        let log = MemoryLog::new();
        let behavior =
            Arc::new(ReplicationBehavior::new(Arc::new(log.clone()), ReplicationConfig::default()));
        let store = Store::builder(MemoryBackend::new()).layer(behavior).build();
        let err = store.set(Entry::new("k", "v"), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed { .. }));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn shutdown_refuses_later_writes() {
        let (backend, _, behavior, store) = replicated();
        let cancel = CancellationToken::new();
        store.set(Entry::new("a", "1"), &cancel).await.unwrap();
        behavior.shutdown().await;

        let err = store.set(Entry::new("b", "2"), &cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed { .. }));
        assert_eq!(backend.keys(), vec!["a".to_owned()]);
        assert!(matches!(behavior.start(store).unwrap_err(), StorageError::Closed { .. }));
    }

    #[tokio::test]
    async fn cancelled_writes_never_reach_the_log() {
        let (_, log, behavior, store) = replicated();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(store.set(Entry::new("k", "v"), &cancel).await.unwrap_err().is_cancelled());
        assert!(log.is_empty());
        behavior.shutdown().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (_, _, behavior, store) = replicated();
        let err = behavior.start(store).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument { .. }));
        behavior.shutdown().await;
    }

    #[test]
    fn config_rejects_zero_drain_timeout() {
        let err = ReplicationConfig::builder().drain_timeout(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "drain_timeout", .. }));
    }
}
