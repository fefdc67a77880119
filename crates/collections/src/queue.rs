//! Persistent double-ended queue over the primitive contract.
//!
//! A queue is a [`QueueState`] record plus one entry per occupied position.
//! The valid range is the half-open interval `[head, tail)`: appends land at
//! `tail`, prepends at `head - 1`, and positions are never reused, so a
//! position may go negative after enough prepends.
//!
//! Every mutating call is an [`Operation`] running through an
//! [`IsolationBehavior`](stowage_storage::behaviors::IsolationBehavior) keyed by
//! queue id. Each one is a single read-modify-persist step: the caller's
//! cancellation is honored while waiting for the queue's lane, and once the
//! step starts it runs to completion. The queue itself holds no locks.
//!
//! A version mismatch on [`Queue::append`] or [`Queue::prepend`] is not an
//! error; it returns `None` and changes nothing.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fail::fail_point;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use stowage_storage::{
    Entry, Handler, KeyedOperation, Operation, Pipeline, StorageError, StorageResult, Store,
    behaviors::{ExclusiveExecutor, LocalExecutor},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    isolated, keys,
    record::{self, uncancellable},
};

/// Persisted bounds of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    /// First valid position.
    pub head: i64,
    /// One past the last valid position.
    pub tail: i64,
    /// When the state record was first created.
    pub created_at: DateTime<Utc>,
}

impl QueueState {
    fn fresh() -> Self {
        Self { head: 0, tail: 0, created_at: Utc::now() }
    }

    /// Number of positions in `[head, tail)`, vanished elements included.
    #[must_use]
    pub fn len(&self) -> i64 {
        self.tail - self.head
    }

    /// Returns `true` when `head == tail`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head >= self.tail
    }
}

/// An element and the position it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// The element's position.
    pub position: i64,
    /// The element; `None` is a stored null.
    pub data: Option<Bytes>,
}

/// Write `data` at `tail`; yields the position written or `None` on a
/// version mismatch.
#[derive(Debug, Clone)]
pub struct Append {
    /// Target queue.
    pub queue_id: String,
    /// Element to store.
    pub data: Option<Bytes>,
    /// Must equal the current `tail` when given.
    pub expected_version: Option<i64>,
}

/// Write `data` at `head - 1`; yields the new `head` or `None` on a version
/// mismatch.
#[derive(Debug, Clone)]
pub struct Prepend {
    /// Target queue.
    pub queue_id: String,
    /// Element to store.
    pub data: Option<Bytes>,
    /// Must equal the current `head - 1` when given.
    pub expected_version: Option<i64>,
}

/// Remove and yield the element at `head`.
#[derive(Debug, Clone)]
pub struct TakeFirst {
    /// Target queue.
    pub queue_id: String,
    /// Skip the physical delete and only advance `head`.
    pub fast: bool,
}

/// Remove and yield the element at `tail - 1`.
#[derive(Debug, Clone)]
pub struct TakeLast {
    /// Target queue.
    pub queue_id: String,
    /// Skip the physical delete and only retreat `tail`.
    pub fast: bool,
}

/// Yield the element at `head` without removing it.
#[derive(Debug, Clone)]
pub struct PeekFirst {
    /// Target queue.
    pub queue_id: String,
}

/// Yield the element at `tail - 1` without removing it.
#[derive(Debug, Clone)]
pub struct PeekLast {
    /// Target queue.
    pub queue_id: String,
}

/// Reset the valid range; yields the new state.
#[derive(Debug, Clone)]
pub struct Truncate {
    /// Target queue.
    pub queue_id: String,
    /// New `head`; unchanged when `None`.
    pub head: Option<i64>,
    /// New `tail`; unchanged when `None`.
    pub tail: Option<i64>,
    /// Skip deleting elements that fall outside the new range.
    pub fast: bool,
}

/// Read a queue's state; a queue never written reports an empty range.
#[derive(Debug, Clone)]
pub struct QueueStateRequest {
    /// Target queue.
    pub queue_id: String,
}

/// Remove every element and the state record; yields `true` if the queue
/// existed.
#[derive(Debug, Clone)]
pub struct DeleteQueue {
    /// Target queue.
    pub queue_id: String,
}

macro_rules! queue_operation {
    ($op:ty, $output:ty, $name:literal) => {
        impl Operation for $op {
            type Output = $output;
            const NAME: &'static str = $name;
        }

        impl KeyedOperation for $op {
            fn key(&self) -> &str {
                &self.queue_id
            }
        }
    };
}

queue_operation!(Append, Option<i64>, "queue.append");
queue_operation!(Prepend, Option<i64>, "queue.prepend");
queue_operation!(TakeFirst, Option<QueueItem>, "queue.take_first");
queue_operation!(TakeLast, Option<QueueItem>, "queue.take_last");
queue_operation!(PeekFirst, Option<QueueItem>, "queue.peek_first");
queue_operation!(PeekLast, Option<QueueItem>, "queue.peek_last");
queue_operation!(Truncate, QueueState, "queue.truncate");
queue_operation!(QueueStateRequest, QueueState, "queue.state");
queue_operation!(DeleteQueue, bool, "queue.delete");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Front,
    Back,
}

/// Terminal handler for every queue operation.
#[derive(Clone)]
struct QueueEngine {
    store: Store,
}

impl QueueEngine {
    async fn load(&self, queue_id: &str) -> StorageResult<Option<QueueState>> {
        record::load(&self.store, &keys::queue_state_key(queue_id)).await
    }

    async fn state(&self, queue_id: &str) -> StorageResult<QueueState> {
        Ok(self.load(queue_id).await?.unwrap_or_else(QueueState::fresh))
    }

    async fn persist(&self, queue_id: &str, state: &QueueState) -> StorageResult<()> {
        fail_point!("queue-before-state-write", |_| {
            Err(StorageError::connection("injected queue state write failure"))
        });
        record::save(&self.store, &keys::queue_state_key(queue_id), state).await
    }

    async fn write_item(
        &self,
        queue_id: &str,
        position: i64,
        data: Option<Bytes>,
    ) -> StorageResult<()> {
        let key = keys::queue_item_key(queue_id, position);
        let entry = match data {
            Some(data) => Entry::new(key, data),
            None => Entry::null(key),
        };
        match self.store.set(entry, &uncancellable()).await? {
            Some(_) => Ok(()),
            None => Err(StorageError::internal(format!(
                "queue {queue_id}: write at position {position} was rejected"
            ))),
        }
    }

    async fn read_item(&self, queue_id: &str, position: i64) -> StorageResult<Option<QueueItem>> {
        let key = keys::queue_item_key(queue_id, position);
        let entry = self.store.get(&key, &uncancellable()).await?;
        Ok(entry.map(|entry| QueueItem { position, data: entry.value }))
    }

    async fn delete_item(&self, queue_id: &str, position: i64) -> StorageResult<bool> {
        self.store.delete(&keys::queue_item_key(queue_id, position), "", &uncancellable()).await
    }

    /// First present element from `end`, with the state advanced past it and
    /// past every vanished position before it.
    async fn scan_end(
        &self,
        queue_id: &str,
        state: &mut QueueState,
        end: End,
    ) -> StorageResult<Option<QueueItem>> {
        while state.head < state.tail {
            let position = match end {
                End::Front => {
                    state.head += 1;
                    state.head - 1
                },
                End::Back => {
                    state.tail -= 1;
                    state.tail
                },
            };
            if let Some(item) = self.read_item(queue_id, position).await? {
                return Ok(Some(item));
            }
            trace!(queue = queue_id, position, "skipped vanished element");
        }
        Ok(None)
    }

    async fn take(&self, queue_id: &str, end: End, fast: bool) -> StorageResult<Option<QueueItem>> {
        let before = self.state(queue_id).await?;
        let mut state = before;
        let taken = self.scan_end(queue_id, &mut state, end).await?;
        if state == before {
            return Ok(None);
        }
        self.persist(queue_id, &state).await?;
        if let Some(item) = &taken
            && !fast
            && let Err(err) = self.delete_item(queue_id, item.position).await
        {
            // The position is already outside the range; a ghost is harmless.
            warn!(
                queue = queue_id,
                position = item.position,
                error = %err,
                "element delete failed"
            );
        }
        Ok(taken)
    }

    async fn peek(&self, queue_id: &str, end: End) -> StorageResult<Option<QueueItem>> {
        let mut state = self.state(queue_id).await?;
        self.scan_end(queue_id, &mut state, end).await
    }
}

#[async_trait]
impl Handler<Append> for QueueEngine {
    async fn handle(
        &self,
        request: Append,
        _cancel: &CancellationToken,
    ) -> StorageResult<Option<i64>> {
        let Append { queue_id, data, expected_version } = request;
        let mut state = self.state(&queue_id).await?;
        if let Some(expected) = expected_version
            && expected != state.tail
        {
            debug!(queue = %queue_id, expected, tail = state.tail, "append version mismatch");
            return Ok(None);
        }
        let position = state.tail;
        self.write_item(&queue_id, position, data).await?;
        state.tail += 1;
        self.persist(&queue_id, &state).await?;
        Ok(Some(position))
    }
}

#[async_trait]
impl Handler<Prepend> for QueueEngine {
    async fn handle(
        &self,
        request: Prepend,
        _cancel: &CancellationToken,
    ) -> StorageResult<Option<i64>> {
        let Prepend { queue_id, data, expected_version } = request;
        let mut state = self.state(&queue_id).await?;
        let position = state.head - 1;
        if let Some(expected) = expected_version
            && expected != position
        {
            debug!(queue = %queue_id, expected, head = state.head, "prepend version mismatch");
            return Ok(None);
        }
        self.write_item(&queue_id, position, data).await?;
        state.head = position;
        self.persist(&queue_id, &state).await?;
        Ok(Some(position))
    }
}

#[async_trait]
impl Handler<TakeFirst> for QueueEngine {
    async fn handle(
        &self,
        request: TakeFirst,
        _cancel: &CancellationToken,
    ) -> StorageResult<Option<QueueItem>> {
        self.take(&request.queue_id, End::Front, request.fast).await
    }
}

#[async_trait]
impl Handler<TakeLast> for QueueEngine {
    async fn handle(
        &self,
        request: TakeLast,
        _cancel: &CancellationToken,
    ) -> StorageResult<Option<QueueItem>> {
        self.take(&request.queue_id, End::Back, request.fast).await
    }
}

#[async_trait]
impl Handler<PeekFirst> for QueueEngine {
    async fn handle(
        &self,
        request: PeekFirst,
        _cancel: &CancellationToken,
    ) -> StorageResult<Option<QueueItem>> {
        self.peek(&request.queue_id, End::Front).await
    }
}

#[async_trait]
impl Handler<PeekLast> for QueueEngine {
    async fn handle(
        &self,
        request: PeekLast,
        _cancel: &CancellationToken,
    ) -> StorageResult<Option<QueueItem>> {
        self.peek(&request.queue_id, End::Back).await
    }
}

#[async_trait]
impl Handler<Truncate> for QueueEngine {
    async fn handle(
        &self,
        request: Truncate,
        _cancel: &CancellationToken,
    ) -> StorageResult<QueueState> {
        let Truncate { queue_id, head, tail, fast } = request;
        let old = self.state(&queue_id).await?;
        let head = head.unwrap_or(old.head);
        let tail = tail.unwrap_or(old.tail);
        if head > tail {
            return Err(StorageError::invalid_argument(format!(
                "queue {queue_id}: truncate head {head} is after tail {tail}"
            )));
        }
        let state = QueueState { head, tail, ..old };
        self.persist(&queue_id, &state).await?;
        if !fast {
            for position in (old.head..old.tail).filter(|p| *p < head || *p >= tail) {
                self.delete_item(&queue_id, position).await?;
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl Handler<QueueStateRequest> for QueueEngine {
    async fn handle(
        &self,
        request: QueueStateRequest,
        _cancel: &CancellationToken,
    ) -> StorageResult<QueueState> {
        self.state(&request.queue_id).await
    }
}

#[async_trait]
impl Handler<DeleteQueue> for QueueEngine {
    async fn handle(
        &self,
        request: DeleteQueue,
        _cancel: &CancellationToken,
    ) -> StorageResult<bool> {
        let Some(state) = self.load(&request.queue_id).await? else {
            return Ok(false);
        };
        for position in state.head..state.tail {
            self.delete_item(&request.queue_id, position).await?;
        }
        let key = keys::queue_state_key(&request.queue_id);
        self.store.delete(&key, "", &uncancellable()).await?;
        Ok(true)
    }
}

/// A family of double-ended queues stored in one [`Store`].
///
/// Cheap to clone; clones share the isolation lanes.
#[derive(Clone)]
pub struct Queue {
    engine: QueueEngine,
    append: Pipeline<Append>,
    prepend: Pipeline<Prepend>,
    take_first: Pipeline<TakeFirst>,
    take_last: Pipeline<TakeLast>,
    peek_first: Pipeline<PeekFirst>,
    peek_last: Pipeline<PeekLast>,
    truncate: Pipeline<Truncate>,
    state: Pipeline<QueueStateRequest>,
    delete: Pipeline<DeleteQueue>,
}

impl Queue {
    /// Queues over `store`, isolated by an in-process [`LocalExecutor`].
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self::with_executor(store, Arc::new(LocalExecutor::new()))
    }

    /// Queues over `store`, isolated by `executor`.
    ///
    /// Every handle that writes the same queues must share one executor.
    #[must_use]
    pub fn with_executor(store: Store, executor: Arc<dyn ExclusiveExecutor>) -> Self {
        let engine = QueueEngine { store };
        let isolation = isolated::shared(executor);
        Self {
            append: isolated::pipeline(&engine, &isolation),
            prepend: isolated::pipeline(&engine, &isolation),
            take_first: isolated::pipeline(&engine, &isolation),
            take_last: isolated::pipeline(&engine, &isolation),
            peek_first: isolated::pipeline(&engine, &isolation),
            peek_last: isolated::pipeline(&engine, &isolation),
            truncate: isolated::pipeline(&engine, &isolation),
            state: isolated::pipeline(&engine, &isolation),
            delete: isolated::pipeline(&engine, &isolation),
            engine,
        }
    }

    /// Appends `data` at the tail.
    ///
    /// With `expected_version`, the write only happens if it equals the
    /// current `tail`. Returns the position written, or `None` on mismatch.
    pub async fn append(
        &self,
        queue_id: &str,
        data: Option<Bytes>,
        expected_version: Option<i64>,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<i64>> {
        let request = Append { queue_id: queue_id.to_owned(), data, expected_version };
        self.append.execute(request, cancel).await
    }

    /// Prepends `data` before the head.
    ///
    /// With `expected_version`, the write only happens if it equals
    /// `head - 1`. Returns the new `head`, or `None` on mismatch.
    pub async fn prepend(
        &self,
        queue_id: &str,
        data: Option<Bytes>,
        expected_version: Option<i64>,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<i64>> {
        let request = Prepend { queue_id: queue_id.to_owned(), data, expected_version };
        self.prepend.execute(request, cancel).await
    }

    /// Removes and returns the first element, or `None` when empty.
    ///
    /// With `fast`, the element's entry is left behind and only `head` moves.
    pub async fn try_take_first(
        &self,
        queue_id: &str,
        fast: bool,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<QueueItem>> {
        self.take_first.execute(TakeFirst { queue_id: queue_id.to_owned(), fast }, cancel).await
    }

    /// Removes and returns the last element, or `None` when empty.
    pub async fn try_take_last(
        &self,
        queue_id: &str,
        fast: bool,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<QueueItem>> {
        self.take_last.execute(TakeLast { queue_id: queue_id.to_owned(), fast }, cancel).await
    }

    /// Returns the first element without removing it.
    pub async fn peek_first(
        &self,
        queue_id: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<QueueItem>> {
        self.peek_first.execute(PeekFirst { queue_id: queue_id.to_owned() }, cancel).await
    }

    /// Returns the last element without removing it.
    pub async fn peek_last(
        &self,
        queue_id: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<Option<QueueItem>> {
        self.peek_last.execute(PeekLast { queue_id: queue_id.to_owned() }, cancel).await
    }

    /// Resets the valid range to `[head, tail)`, keeping either bound that is
    /// `None`.
    ///
    /// Unless `fast`, elements of the old range that fall outside the new one
    /// are deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidArgument`] if the resulting head is
    /// after the resulting tail.
    pub async fn truncate(
        &self,
        queue_id: &str,
        head: Option<i64>,
        tail: Option<i64>,
        fast: bool,
        cancel: &CancellationToken,
    ) -> StorageResult<QueueState> {
        let request = Truncate { queue_id: queue_id.to_owned(), head, tail, fast };
        self.truncate.execute(request, cancel).await
    }

    /// Returns the queue's state.
    pub async fn state(
        &self,
        queue_id: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<QueueState> {
        self.state.execute(QueueStateRequest { queue_id: queue_id.to_owned() }, cancel).await
    }

    /// Number of positions in the valid range.
    pub async fn count(&self, queue_id: &str, cancel: &CancellationToken) -> StorageResult<i64> {
        Ok(self.state(queue_id, cancel).await?.len())
    }

    /// Deletes every element and the state record.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn delete(&self, queue_id: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        self.delete.execute(DeleteQueue { queue_id: queue_id.to_owned() }, cancel).await
    }

    /// Streams the elements from head to tail, starting `skip` positions in.
    ///
    /// The range is read once when the stream is first polled; elements that
    /// vanish before they are reached are skipped. Re-issuing the call starts
    /// over from the current state.
    pub fn get_all(
        &self,
        queue_id: &str,
        skip: Option<i64>,
        cancel: &CancellationToken,
    ) -> BoxStream<'static, StorageResult<QueueItem>> {
        self.scan(queue_id, skip, End::Front, cancel)
    }

    /// Streams the elements from tail to head, starting `skip` positions in.
    pub fn get_all_reverse(
        &self,
        queue_id: &str,
        skip: Option<i64>,
        cancel: &CancellationToken,
    ) -> BoxStream<'static, StorageResult<QueueItem>> {
        self.scan(queue_id, skip, End::Back, cancel)
    }

    fn scan(
        &self,
        queue_id: &str,
        skip: Option<i64>,
        from: End,
        cancel: &CancellationToken,
    ) -> BoxStream<'static, StorageResult<QueueItem>> {
        let scan = Scan {
            queue: self.clone(),
            queue_id: queue_id.to_owned(),
            skip: skip.unwrap_or(0).max(0),
            from,
            cancel: cancel.clone(),
            window: None,
            done: false,
        };
        stream::unfold(scan, |mut scan| async move {
            let item = scan.step().await?;
            Some((item, scan))
        })
        .boxed()
    }
}

struct Scan {
    queue: Queue,
    queue_id: String,
    skip: i64,
    from: End,
    cancel: CancellationToken,
    /// Positions still to visit, half-open.
    window: Option<(i64, i64)>,
    done: bool,
}

impl Scan {
    async fn step(&mut self) -> Option<StorageResult<QueueItem>> {
        if self.done {
            return None;
        }
        let result = self.advance().await;
        if !matches!(result, Some(Ok(_))) {
            self.done = true;
        }
        result
    }

    async fn advance(&mut self) -> Option<StorageResult<QueueItem>> {
        if self.cancel.is_cancelled() {
            return Some(Err(StorageError::Cancelled));
        }
        let (mut low, mut high) = match self.window {
            Some(window) => window,
            None => match self.queue.state(&self.queue_id, &self.cancel).await {
                Ok(state) => match self.from {
                    End::Front => (state.head.saturating_add(self.skip), state.tail),
                    End::Back => (state.head, state.tail.saturating_sub(self.skip)),
                },
                Err(err) => return Some(Err(err)),
            },
        };
        while low < high {
            let position = match self.from {
                End::Front => {
                    low += 1;
                    low - 1
                },
                End::Back => {
                    high -= 1;
                    high
                },
            };
            self.window = Some((low, high));
            match self.queue.engine.read_item(&self.queue_id, position).await {
                Ok(Some(item)) => return Some(Ok(item)),
                Ok(None) => {},
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}
