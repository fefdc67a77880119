//! Durable append-only log consumed by the replication behavior.
//!
//! A [`DurableLog`] hands out monotonically increasing positions on write and
//! replays records from any position through an infinite stream that waits
//! when it has caught up. Delivery is at-least-once: a subscriber may see a
//! record more than once across restarts and must deduplicate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::error::StorageResult;

/// Append-only record log with replay from a position.
#[async_trait]
pub trait DurableLog: Send + Sync + 'static {
    /// Appends `record` and returns its position once it is durable.
    async fn write(&self, record: Bytes) -> StorageResult<u64>;

    /// Streams `(position, record)` pairs starting at `from`.
    ///
    /// The stream never ends on its own; it suspends until new records are
    /// written.
    fn subscribe(&self, from: u64) -> BoxStream<'static, StorageResult<(u64, Bytes)>>;
}

#[derive(Default)]
struct LogInner {
    records: RwLock<Vec<Bytes>>,
    appended: Notify,
}

impl LogInner {
    fn record_at(&self, position: u64) -> Option<Bytes> {
        let index = usize::try_from(position).ok()?;
        self.records.read().get(index).cloned()
    }
}

/// In-process [`DurableLog`]; durable for the lifetime of the process only.
///
/// Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn write(&self, record: Bytes) -> StorageResult<u64> {
        let position = {
            let mut records = self.inner.records.write();
            records.push(record);
            (records.len() - 1) as u64
        };
        self.inner.appended.notify_waiters();
        Ok(position)
    }

    fn subscribe(&self, from: u64) -> BoxStream<'static, StorageResult<(u64, Bytes)>> {
        futures::stream::unfold((Arc::clone(&self.inner), from), |(inner, position)| async move {
            loop {
                if let Some(record) = inner.record_at(position) {
                    return Some((Ok((position, record)), (inner, position + 1)));
                }
                let appended = inner.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();
                if inner.record_at(position).is_none() {
                    appended.await;
                }
            }
        })
        .boxed()
    }
}
