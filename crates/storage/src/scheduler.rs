//! Delayed-notification contracts consumed by the TTL behavior.
//!
//! A [`Scheduler`] accepts opaque payloads to deliver after a delay, optionally
//! repeating. Delivery happens later through a [`Dispatch`] callback owned by
//! whoever drives the scheduler. `stowage-collections` ships an implementation
//! built on its time series.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// Accepts delayed notifications.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Schedules `payload` for delivery after `trigger_in`, replacing any
    /// pending notification with the same `id`.
    ///
    /// With `repeat_every`, the notification is redelivered at that interval
    /// until cancelled.
    async fn schedule(
        &self,
        id: &str,
        payload: Bytes,
        trigger_in: Duration,
        repeat_every: Option<Duration>,
    ) -> StorageResult<()>;

    /// Cancels the pending notification `id`. Unknown ids are a no-op.
    async fn cancel(&self, id: &str) -> StorageResult<()>;
}

/// Receives notifications when they fall due.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Delivers the notification `id` with its payload.
    async fn dispatch(&self, id: &str, payload: Bytes) -> StorageResult<()>;
}
