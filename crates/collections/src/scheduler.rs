//! Delayed and repeating notifications kept in a time series.
//!
//! [`TimeSeriesScheduler`] stores each pending notification as a series entry
//! whose timestamp is its trigger time, so "what is due" is a range scan up
//! to now. Something has to drive delivery: call
//! [`dispatch_due`](TimeSeriesScheduler::dispatch_due) periodically or let
//! [`spawn_dispatch_loop`](TimeSeriesScheduler::spawn_dispatch_loop) do it.
//!
//! Delivery is at-least-once. A notification whose dispatch fails stays due
//! and is offered again on the next pass.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_storage::{Dispatch, Scheduler, StorageError, StorageResult};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::time_series::{TimeSeries, TimeSeriesEntry};

/// Series id used by [`TimeSeriesScheduler::new`].
pub const DEFAULT_SERIES_ID: &str = "scheduler";

#[derive(Serialize, Deserialize)]
struct StoredNotification {
    payload: Bytes,
    repeat_every_millis: Option<u64>,
}

/// A pending notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledNotification {
    /// Caller-chosen id, unique within the scheduler.
    pub id: String,
    /// When the notification falls due.
    pub trigger_at: DateTime<Utc>,
    /// Opaque payload handed to [`Dispatch::dispatch`].
    pub payload: Bytes,
    /// Redelivery interval for repeating notifications.
    pub repeat_every: Option<Duration>,
}

impl ScheduledNotification {
    fn from_entry(entry: TimeSeriesEntry) -> StorageResult<Self> {
        let stored: StoredNotification = rmp_serde::from_slice(&entry.data).map_err(|e| {
            StorageError::serialization_with_source("decoding scheduled notification", e)
        })?;
        Ok(Self {
            id: entry.id,
            trigger_at: entry.timestamp,
            payload: stored.payload,
            repeat_every: stored.repeat_every_millis.map(Duration::from_millis),
        })
    }

    /// The trigger time after a successful delivery at `now`; never in the
    /// past, so a scheduler that was down does not replay every missed tick.
    fn next_trigger(&self, every: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = after(self.trigger_at, every);
        if next > now { next } else { after(now, every) }
    }
}

/// `at + delay`, saturating at the latest representable instant.
fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// [`Scheduler`] backed by one series of a [`TimeSeries`].
#[derive(Clone)]
pub struct TimeSeriesScheduler {
    series: TimeSeries,
    series_id: String,
}

impl TimeSeriesScheduler {
    /// A scheduler keeping its notifications in the `scheduler` series.
    #[must_use]
    pub fn new(series: TimeSeries) -> Self {
        Self::with_series_id(series, DEFAULT_SERIES_ID)
    }

    /// A scheduler keeping its notifications in `series_id`.
    #[must_use]
    pub fn with_series_id(series: TimeSeries, series_id: impl Into<String>) -> Self {
        Self { series, series_id: series_id.into() }
    }

    /// Schedules `payload` for `trigger_at`, replacing any pending
    /// notification with the same `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidArgument`] for a zero `repeat_every`.
    pub async fn schedule_at(
        &self,
        id: &str,
        payload: Bytes,
        trigger_at: DateTime<Utc>,
        repeat_every: Option<Duration>,
    ) -> StorageResult<()> {
        if repeat_every.is_some_and(|every| every.is_zero()) {
            return Err(StorageError::invalid_argument(format!(
                "notification {id}: repeat interval must be positive"
            )));
        }
        let stored = StoredNotification {
            payload,
            repeat_every_millis: repeat_every
                .map(|every| u64::try_from(every.as_millis()).unwrap_or(u64::MAX).max(1)),
        };
        let data = rmp_serde::to_vec_named(&stored).map_err(|e| {
            StorageError::serialization_with_source("encoding scheduled notification", e)
        })?;
        self.series.add_or_update(&self.series_id, id, trigger_at, data.into()).await
    }

    /// Returns the pending notification `id`.
    pub async fn get(&self, id: &str) -> StorageResult<Option<ScheduledNotification>> {
        let entry = self.series.get(&self.series_id, id).await?;
        entry.map(ScheduledNotification::from_entry).transpose()
    }

    /// Notifications due in `[from, to]`, earliest first.
    pub async fn get_all(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<ScheduledNotification>> {
        self.series
            .get_range(&self.series_id, from, to)
            .await?
            .into_iter()
            .map(ScheduledNotification::from_entry)
            .collect()
    }

    /// Delivers every notification due at or before `now`.
    ///
    /// Delivered one-shot notifications are removed and repeating ones move
    /// to their next trigger time. A notification replaced or cancelled while
    /// its delivery was in flight is left as it now stands. Returns the
    /// number delivered.
    pub async fn dispatch_due(
        &self,
        now: DateTime<Utc>,
        dispatch: &dyn Dispatch,
    ) -> StorageResult<usize> {
        let due = self.get_all(DateTime::<Utc>::MIN_UTC, now).await?;
        let mut delivered = 0;
        for notification in due {
            let result = dispatch.dispatch(&notification.id, notification.payload.clone()).await;
            if let Err(err) = result {
                warn!(id = %notification.id, error = %err, "dispatch failed");
                continue;
            }
            delivered += 1;

            if self.get(&notification.id).await?.as_ref() != Some(&notification) {
                debug!(id = %notification.id, "notification changed during dispatch");
                continue;
            }
            match notification.repeat_every {
                Some(every) => {
                    let next = notification.next_trigger(every, now);
                    let ScheduledNotification { id, payload, .. } = notification;
                    self.schedule_at(&id, payload, next, Some(every)).await?;
                },
                None => {
                    self.series.remove(&self.series_id, &notification.id).await?;
                },
            }
        }
        Ok(delivered)
    }

    /// Spawns a task calling [`dispatch_due`](Self::dispatch_due) every
    /// `interval` until the returned token is cancelled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_dispatch_loop(
        &self,
        interval: Duration,
        dispatch: Arc<dyn Dispatch>,
    ) -> CancellationToken {
        let stop = CancellationToken::new();
        let scheduler = self.clone();
        let token = stop.clone();
        tokio::spawn(async move {
            info!(series = %scheduler.series_id, ?interval, "dispatch loop started");
            loop {
                select! {
                    () = sleep(interval) => {}
                    () = token.cancelled() => break,
                }
                match scheduler.dispatch_due(Utc::now(), dispatch.as_ref()).await {
                    Ok(0) => {},
                    Ok(delivered) => debug!(delivered, "dispatched due notifications"),
                    Err(err) => warn!(error = %err, "dispatch pass failed"),
                }
            }
            info!(series = %scheduler.series_id, "dispatch loop stopped");
        });
        stop
    }
}

#[async_trait]
impl Scheduler for TimeSeriesScheduler {
    async fn schedule(
        &self,
        id: &str,
        payload: Bytes,
        trigger_in: Duration,
        repeat_every: Option<Duration>,
    ) -> StorageResult<()> {
        self.schedule_at(id, payload, after(Utc::now(), trigger_in), repeat_every).await
    }

    async fn cancel(&self, id: &str) -> StorageResult<()> {
        self.series.remove(&self.series_id, id).await?;
        Ok(())
    }
}
