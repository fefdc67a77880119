//! Queued writes with bounded parallelism.
//!
//! [`QueuedWriteBehavior`] acknowledges `set` and `delete` as soon as the
//! write is accepted onto a worker lane and applies it in the background.
//! Keys are sharded across a fixed number of lanes by hash, so writes to one
//! key apply in submission order while at most `workers` writes run at once.
//!
//! Acknowledged results are synthesized:
//!
//! - `set` returns the request's etag when one was given, otherwise a fresh token
//! - `delete` returns `true`
//!
//! A background write that fails (or is rejected by its precondition) is
//! logged and counted in [`QueuedWriteBehavior::failed_writes`]; the caller
//! has already been answered.
//!
//! With `queue_reads`, `get` is queued behind earlier writes to the same key
//! and awaited, so a caller reads its own writes. Without it reads go
//! straight through and may observe a write that has not landed yet.
//!
//! Lanes are spawned on the current tokio runtime when the behavior is
//! created.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::{Notify, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    error::{ConfigError, StorageError, StorageResult},
    ops::{DeleteRequest, GetRequest, SetRequest},
    pipeline::{Behavior, Next},
    store::{Layer, LayerStack},
    types::Entry,
};

/// Default number of worker lanes.
pub const DEFAULT_WORKERS: usize = 4;

/// Default number of writes a lane buffers before submitters wait.
pub const DEFAULT_LANE_CAPACITY: usize = 1024;

/// Worker count, lane depth and read routing for [`QueuedWriteBehavior`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueuedWriteConfig {
    #[serde(default = "default_workers")]
    workers: usize,
    #[serde(default = "default_lane_capacity")]
    lane_capacity: usize,
    #[serde(default)]
    queue_reads: bool,
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_lane_capacity() -> usize {
    DEFAULT_LANE_CAPACITY
}

impl Default for QueuedWriteConfig {
    fn default() -> Self {
        Self { workers: DEFAULT_WORKERS, lane_capacity: DEFAULT_LANE_CAPACITY, queue_reads: false }
    }
}

#[bon::bon]
impl QueuedWriteConfig {
    /// Creates a queued-write configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `workers` or `lane_capacity`
    /// is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_WORKERS)] workers: usize,
        #[builder(default = DEFAULT_LANE_CAPACITY)] lane_capacity: usize,
        #[builder(default)] queue_reads: bool,
    ) -> Result<Self, ConfigError> {
        if workers == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "workers",
                min: "1".into(),
                value: workers.to_string(),
            });
        }
        if lane_capacity == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "lane_capacity",
                min: "1".into(),
                value: lane_capacity.to_string(),
            });
        }
        Ok(Self { workers, lane_capacity, queue_reads })
    }

    /// Number of worker lanes.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Buffered writes per lane.
    #[must_use]
    pub fn lane_capacity(&self) -> usize {
        self.lane_capacity
    }

    /// Whether reads are queued behind writes.
    #[must_use]
    pub fn queue_reads(&self) -> bool {
        self.queue_reads
    }
}

type Job = BoxFuture<'static, ()>;

/// Applies writes on background lanes and acknowledges them immediately.
pub struct QueuedWriteBehavior {
    config: QueuedWriteConfig,
    /// `None` once shut down.
    lanes: RwLock<Option<Vec<mpsc::Sender<Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    failed_writes: Arc<AtomicU64>,
}

impl QueuedWriteBehavior {
    /// Spawns `config.workers()` lanes on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(config: QueuedWriteConfig) -> Self {
        let mut senders = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        for lane in 0..config.workers {
            let (tx, rx) = mpsc::channel(config.lane_capacity);
            senders.push(tx);
            workers.push(tokio::spawn(run_lane(lane, rx)));
        }
        info!(workers = config.workers, "queued write lanes started");
        Self {
            config,
            lanes: RwLock::new(Some(senders)),
            workers: Mutex::new(workers),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            failed_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &QueuedWriteConfig {
        &self.config
    }

    /// Background writes that failed or were rejected since creation.
    #[must_use]
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Jobs accepted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Waits until every accepted job has finished.
    pub async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting work, drains every lane and waits for the workers.
    ///
    /// Operations submitted afterwards fail with [`StorageError::Closed`].
    pub async fn shutdown(&self) {
        let senders = self.lanes.write().take();
        drop(senders);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "queued write lane panicked");
            }
        }
        info!(failed_writes = self.failed_writes(), "queued write lanes stopped");
    }

    fn lane_for(&self, key: &str) -> StorageResult<mpsc::Sender<Job>> {
        let lanes = self.lanes.read();
        let lanes = lanes.as_ref().ok_or_else(|| StorageError::closed("queued writes"))?;
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % lanes.len() as u64) as usize;
        Ok(lanes[index].clone())
    }

    async fn enqueue(&self, key: &str, cancel: &CancellationToken, work: Job) -> StorageResult<()> {
        let lane = self.lane_for(key)?;
        let pending = Arc::clone(&self.pending);
        let idle = Arc::clone(&self.idle);
        let job: Job = Box::pin(async move {
            work.await;
            if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                idle.notify_waiters();
            }
        });

        self.pending.fetch_add(1, Ordering::AcqRel);
        let sent = select! {
            biased;
            () = cancel.cancelled() => Err(StorageError::Cancelled),
            sent = lane.send(job) => sent.map_err(|_| StorageError::closed("queued writes")),
        };
        if sent.is_err() && self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
        trace!(%key, "queued");
        sent
    }

    fn failure_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.failed_writes)
    }
}

async fn run_lane(lane: usize, mut jobs: mpsc::Receiver<Job>) {
    while let Some(job) = jobs.recv().await {
        job.await;
    }
    debug!(lane, "queued write lane drained");
}

#[async_trait]
impl Behavior<SetRequest> for QueuedWriteBehavior {
    async fn handle(
        &self,
        request: SetRequest,
        cancel: &CancellationToken,
        next: Next<SetRequest>,
    ) -> StorageResult<Option<String>> {
        let key = request.entry.key.clone();
        let etag = if request.entry.etag.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            request.entry.etag.clone()
        };

        let failed = self.failure_counter();
        let job_key = key.clone();
        let work = Box::pin(async move {
            match next.run(request, &CancellationToken::new()).await {
                Ok(Some(_)) => {},
                Ok(None) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %job_key, "queued set rejected by etag precondition");
                },
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %job_key, error = %err, "queued set failed");
                },
            }
        });
        self.enqueue(&key, cancel, work).await?;
        Ok(Some(etag))
    }
}

#[async_trait]
impl Behavior<DeleteRequest> for QueuedWriteBehavior {
    async fn handle(
        &self,
        request: DeleteRequest,
        cancel: &CancellationToken,
        next: Next<DeleteRequest>,
    ) -> StorageResult<bool> {
        let key = request.key.clone();
        let failed = self.failure_counter();
        let job_key = key.clone();
        let work = Box::pin(async move {
            if let Err(err) = next.run(request, &CancellationToken::new()).await {
                failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = %job_key, error = %err, "queued delete failed");
            }
        });
        self.enqueue(&key, cancel, work).await?;
        Ok(true)
    }
}

#[async_trait]
impl Behavior<GetRequest> for QueuedWriteBehavior {
    async fn handle(
        &self,
        request: GetRequest,
        cancel: &CancellationToken,
        next: Next<GetRequest>,
    ) -> StorageResult<Option<Entry>> {
        if !self.config.queue_reads {
            return next.run(request, cancel).await;
        }

        let key = request.key.clone();
        let (tx, rx) = oneshot::channel();
        let work = Box::pin(async move {
            let _ = tx.send(next.run(request, &CancellationToken::new()).await);
        });
        self.enqueue(&key, cancel, work).await?;
        select! {
            biased;
            () = cancel.cancelled() => Err(StorageError::Cancelled),
            result = rx => result.map_err(|_| StorageError::closed("queued writes"))?,
        }
    }
}

impl Layer for QueuedWriteBehavior {
    fn register(self: Arc<Self>, stack: &mut LayerStack) {
        stack.on_set(self.clone());
        stack.on_get(self.clone());
        stack.on_delete(self);
    }
}
