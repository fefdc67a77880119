//! Single-writer isolation.
//!
//! Every keyed operation runs inside an [`ExclusiveExecutor`] lane for its
//! key. Operations on one key execute one at a time, in submission order;
//! operations on different keys never wait on each other.
//!
//! [`LocalExecutor`] keeps one lane per active key in a map. A lane is created
//! on first use and dropped as soon as nobody holds or waits on it, so idle
//! keys cost nothing. Waiting is FIFO because each lane is a fair
//! [`tokio::sync::Mutex`].

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    error::{StorageError, StorageResult},
    ops::{DeleteRequest, GetRequest, SetRequest},
    pipeline::{Behavior, KeyedOperation, Next},
    store::{Layer, LayerStack},
};

/// Runs units of work one at a time per key.
///
/// Implementations other than [`LocalExecutor`] may route keys to a remote
/// single-writer host.
#[async_trait]
pub trait ExclusiveExecutor: Send + Sync + 'static {
    /// Runs `work` once every earlier submission for `key` has finished.
    ///
    /// Fails with [`StorageError::Cancelled`] if `cancel` fires before `work`
    /// starts; once started, `work` runs to completion.
    async fn run(
        &self,
        key: &str,
        cancel: &CancellationToken,
        work: BoxFuture<'_, ()>,
    ) -> StorageResult<()>;
}

type Lane = Arc<tokio::sync::Mutex<()>>;

/// In-process [`ExclusiveExecutor`] with lazily created, self-evicting lanes.
#[derive(Default)]
pub struct LocalExecutor {
    lanes: Mutex<HashMap<String, Lane>>,
}

impl LocalExecutor {
    /// Creates an executor with no lanes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a running or waiting operation.
    #[must_use]
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    fn acquire(&self, key: &str) -> LaneLease<'_> {
        let lane = Arc::clone(self.lanes.lock().entry(key.to_owned()).or_default());
        LaneLease { executor: self, key: key.to_owned(), lane }
    }
}

/// A reference to a lane that evicts it on drop when it was the last one.
struct LaneLease<'a> {
    executor: &'a LocalExecutor,
    key: String,
    lane: Lane,
}

impl Drop for LaneLease<'_> {
    fn drop(&mut self) {
        let mut lanes = self.executor.lanes.lock();
        // One reference in the map plus ours.
        if let Some(lane) = lanes.get(&self.key)
            && Arc::ptr_eq(lane, &self.lane)
            && Arc::strong_count(lane) == 2
        {
            lanes.remove(&self.key);
            trace!(key = %self.key, "evicted idle lane");
        }
    }
}

#[async_trait]
impl ExclusiveExecutor for LocalExecutor {
    async fn run(
        &self,
        key: &str,
        cancel: &CancellationToken,
        work: BoxFuture<'_, ()>,
    ) -> StorageResult<()> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let lease = self.acquire(key);
        let turn = select! {
            biased;
            () = cancel.cancelled() => return Err(StorageError::Cancelled),
            turn = lease.lane.lock() => turn,
        };
        work.await;
        drop(turn);
        drop(lease);
        Ok(())
    }
}

/// Routes keyed operations through an [`ExclusiveExecutor`].
///
/// Register it outside the cache, the etag behavior and the write queue so
/// their read-modify-write steps and invalidations happen under the same
/// per-key exclusion as the operation itself.
pub struct IsolationBehavior<E: ExclusiveExecutor + ?Sized = LocalExecutor> {
    executor: Arc<E>,
}

impl IsolationBehavior<LocalExecutor> {
    /// Isolation backed by a fresh [`LocalExecutor`].
    #[must_use]
    pub fn local() -> Self {
        Self { executor: Arc::new(LocalExecutor::new()) }
    }
}

impl<E: ExclusiveExecutor + ?Sized> IsolationBehavior<E> {
    /// Isolation backed by `executor`; share it to isolate several stores or
    /// data structures against each other.
    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }

    /// The backing executor.
    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }
}

async fn run_isolated<Op, E>(
    executor: &E,
    request: Op,
    cancel: &CancellationToken,
    next: Next<Op>,
) -> StorageResult<Op::Output>
where
    Op: KeyedOperation,
    E: ExclusiveExecutor + ?Sized,
{
    let key = request.key().to_owned();
    let mut output = None;
    let work = Box::pin(async {
        output = Some(next.run(request, cancel).await);
    });
    executor.run(&key, cancel, work).await?;
    output.unwrap_or_else(|| Err(StorageError::internal("isolated work did not complete")))
}

#[async_trait]
impl<Op, E> Behavior<Op> for IsolationBehavior<E>
where
    Op: KeyedOperation,
    E: ExclusiveExecutor + ?Sized,
{
    async fn handle(
        &self,
        request: Op,
        cancel: &CancellationToken,
        next: Next<Op>,
    ) -> StorageResult<Op::Output> {
        run_isolated(&*self.executor, request, cancel, next).await
    }
}

impl<E: ExclusiveExecutor + ?Sized> Layer for IsolationBehavior<E> {
    fn register(self: Arc<Self>, stack: &mut LayerStack) {
        stack.on_set(Arc::clone(&self) as Arc<dyn Behavior<SetRequest>>);
        stack.on_get(Arc::clone(&self) as Arc<dyn Behavior<GetRequest>>);
        stack.on_delete(self as Arc<dyn Behavior<DeleteRequest>>);
    }
}
