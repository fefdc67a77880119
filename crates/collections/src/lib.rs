//! Higher-level collections composed on the stowage primitive contract.
//!
//! Every collection here keeps its data as ordinary entries in a
//! [`stowage_storage::Store`], so it works over any backend the store can
//! wrap:
//!
//! - [`Queue`]: a double-ended queue addressed by id, with per-queue
//!   single-writer semantics.
//! - [`EventStore`]: append-only event streams with optimistic concurrency,
//!   retention limits and a per-stream time-to-live.
//! - [`TimeSeries`]: timestamp-ordered entries, indexed through an
//!   [`OrderedIndex`] such as [`MemoryIndex`].
//! - [`TimeSeriesScheduler`]: a [`stowage_storage::Scheduler`] that keeps
//!   pending notifications in a time series.
//!
//! # Key layout
//!
//! | Record | Key |
//! |--------|-----|
//! | queue state | `queue:{id}:state` |
//! | queue item | `queue:{id}:{position}` |
//! | stream state | `stream:{id}:state` |
//! | event | `stream:{id}:{event_number}` |
//! | series payload | `series:{len}:{series_id}:{entry_id}` |
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use stowage_collections::Queue;
//! use stowage_storage::{MemoryBackend, Store};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = Queue::new(Store::builder(MemoryBackend::new()).build());
//!     let cancel = CancellationToken::new();
//!
//!     queue.append("jobs", Some(Bytes::from("a")), None, &cancel).await?;
//!     queue.append("jobs", Some(Bytes::from("b")), None, &cancel).await?;
//!
//!     let first = queue.try_take_first("jobs", false, &cancel).await?;
//!     assert_eq!(first.and_then(|item| item.data), Some(Bytes::from("a")));
//!     assert_eq!(queue.count("jobs", &cancel).await?, 1);
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod event_store;
mod isolated;
pub mod keys;
pub mod queue;
mod record;
pub mod scheduler;
pub mod time_series;

pub use event_store::{
    EventRange, EventStore, EventStoreState, ExpectedVersion, NewEvent, RecordedEvent,
    StreamOptions, VersionRange,
};
pub use keys::{decode_timestamp, encode_timestamp};
pub use queue::{Queue, QueueItem, QueueState};
pub use scheduler::{ScheduledNotification, TimeSeriesScheduler};
pub use time_series::{MemoryIndex, OrderedIndex, TimeSeries, TimeSeriesEntry};
