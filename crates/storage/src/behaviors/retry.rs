//! Retry behavior for transient failures.
//!
//! [`RetryBehavior`] re-runs the rest of the pipeline while a caller-supplied
//! predicate accepts the failure. By default only transient errors
//! ([`StorageError::is_transient`]) are retried.
//!
//! # Outcomes
//!
//! - success on any attempt returns that result
//! - a first failure the predicate refuses is returned unchanged
//! - once at least one retry has happened, giving up (predicate refusal or exhausted attempts)
//!   yields [`StorageError::RetriesExhausted`] carrying each attempt's error, oldest first
//! - cancellation is checked before every attempt and interrupts the backoff sleep
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0–50% of the computed delay is added

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use fail::fail_point;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ConfigError, StorageError, StorageResult},
    ops::{ClearRequest, DeleteRequest, FeaturesRequest, GetRequest, SetRequest},
    pipeline::{Behavior, Next, Operation},
    store::{Layer, LayerStack},
};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Default ceiling on the retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Decides whether attempt `n` (1-based) may be followed by another one after
/// failing with the given error.
pub type RetryPredicate = Arc<dyn Fn(u32, &StorageError) -> bool + Send + Sync>;

/// Retry limits and backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    initial_backoff: Duration,
    /// Ceiling on the retry delay.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_backoff` is zero or smaller than
    /// `initial_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        if max_backoff.is_zero() {
            return Err(ConfigError::MustBePositive { field: "max_backoff", value: "0s".into() });
        }
        if max_backoff < initial_backoff {
            return Err(ConfigError::InvalidRelation {
                field: "max_backoff",
                relation: format!(">= initial_backoff ({}ms)", initial_backoff.as_millis()),
            });
        }
        Ok(Self { max_retries, initial_backoff, max_backoff })
    }

    /// Returns the number of retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the initial backoff.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the backoff ceiling.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    // Add jitter: 0–50% of the computed delay
    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::rng().random_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}

/// Re-runs the continuation while the predicate accepts the failure.
pub struct RetryBehavior {
    config: RetryConfig,
    predicate: RetryPredicate,
}

impl RetryBehavior {
    /// Retries transient errors per `config`.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config, predicate: Arc::new(|_, err| err.is_transient()) }
    }

    /// Replaces the predicate.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(u32, &StorageError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    #[tracing::instrument(
        name = "retry",
        skip_all,
        fields(operation = Op::NAME, max_retries = self.config.max_retries)
    )]
    async fn run<Op: Operation>(
        &self,
        request: Op,
        cancel: &CancellationToken,
        next: Next<Op>,
    ) -> StorageResult<Op::Output> {
        let mut errors = Vec::new();

        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let err = match next.clone().run(request.clone(), cancel).await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(attempt = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => err,
            };

            if !(self.predicate)(attempt + 1, &err) {
                if errors.is_empty() {
                    return Err(err);
                }
                tracing::debug!(attempt = attempt + 1, error = %err, "retry refused by predicate");
                errors.push(err);
                break;
            }
            if attempt == self.config.max_retries {
                errors.push(err);
                break;
            }

            let delay = compute_backoff(&self.config, attempt);
            tracing::debug!(
                attempt = attempt + 1,
                max_attempts = self.config.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after backoff",
            );
            errors.push(err);
            fail_point!("retry-before-sleep");
            select! {
                () = cancel.cancelled() => return Err(StorageError::Cancelled),
                () = tokio::time::sleep(delay) => {},
            }
        }

        tracing::warn!(attempts = errors.len(), "giving up after retries");
        Err(StorageError::RetriesExhausted { attempts: errors.len() as u32, errors })
    }
}

#[async_trait]
impl<Op: Operation> Behavior<Op> for RetryBehavior {
    async fn handle(
        &self,
        request: Op,
        cancel: &CancellationToken,
        next: Next<Op>,
    ) -> StorageResult<Op::Output> {
        self.run(request, cancel, next).await
    }
}

impl Layer for RetryBehavior {
    fn register(self: Arc<Self>, stack: &mut LayerStack) {
        stack.on_set(Arc::clone(&self) as Arc<dyn Behavior<SetRequest>>);
        stack.on_get(Arc::clone(&self) as Arc<dyn Behavior<GetRequest>>);
        stack.on_delete(Arc::clone(&self) as Arc<dyn Behavior<DeleteRequest>>);
        stack.on_features(Arc::clone(&self) as Arc<dyn Behavior<FeaturesRequest>>);
        stack.on_clear(self as Arc<dyn Behavior<ClearRequest>>);
    }
}
