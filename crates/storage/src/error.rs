//! Storage error types and result alias.
//!
//! Every layer of a stowage store (backend, behaviors, data structures) maps
//! its failures onto [`StorageError`]. Expected concurrency outcomes such as a
//! stale etag are *not* errors; they surface as sentinel return values
//! (`None` / `false`). The one exception is the event store, which reports a
//! mismatched expected version as [`StorageError::WrongExpectedVersion`].
//!
//! # Error Types
//!
//! - [`StorageError::InvalidKey`] / [`StorageError::SizeLimitExceeded`] /
//!   [`StorageError::InvalidArgument`] - precondition violations, never retried
//! - [`StorageError::WrongExpectedVersion`] - event stream optimistic-concurrency conflict
//! - [`StorageError::NotSupported`] - operation the backend cannot perform
//! - [`StorageError::Connection`] / [`StorageError::Timeout`] - transient failures, retryable
//! - [`StorageError::RetriesExhausted`] - aggregate of every failed retry attempt
//! - [`StorageError::Cancelled`] / [`StorageError::Closed`] - caller or shutdown interruption
//!
//! # Example
//!
//! ```
//! use stowage_storage::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::invalid_key(key, "key is reserved"))
//! }
//! ```

use std::{fmt, sync::Arc};

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The expected version a writer asserted on an event stream, as reported in
/// [`StorageError::WrongExpectedVersion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersionKind {
    /// The stream had to exist already.
    StreamExists,
    /// The stream had to be at exactly this version.
    Exact(i64),
}

impl fmt::Display for ExpectedVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamExists => write!(f, "stream-exists"),
            Self::Exact(version) => write!(f, "{version}"),
        }
    }
}

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The key is empty or otherwise unusable.
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// A key or value exceeded the size the backend accepts.
    #[error("{kind} size {actual} exceeds limit of {limit} bytes")]
    SizeLimitExceeded {
        /// Which limit was violated (`"key"` or `"value"`).
        kind: &'static str,
        /// The offending size in bytes.
        actual: usize,
        /// The configured limit in bytes.
        limit: usize,
    },

    /// A request argument was outside its valid domain.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the violated precondition.
        message: String,
    },

    /// An event stream was not at the version the writer expected.
    ///
    /// `actual` is `-1` when the stream has never been written.
    #[error("Wrong expected version on stream {stream}: expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        /// The stream identifier.
        stream: String,
        /// What the writer asserted.
        expected: ExpectedVersionKind,
        /// The stream's current version.
        actual: i64,
    },

    /// The operation is not supported by this backend or store.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// Connection or network error.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    ///
    /// Indicates a stored record could not be encoded or decoded, typically
    /// data corruption or a schema mismatch.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out.
    #[error("Operation timeout")]
    Timeout,

    /// The caller's cancellation token fired before the operation completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The component handling the operation has shut down.
    #[error("{component} is closed")]
    Closed {
        /// The component that rejected the operation.
        component: &'static str,
    },

    /// Every retry attempt failed with an error the retry predicate accepted.
    #[error("Operation failed after {attempts} attempts: {}", summarize(errors))]
    RetriesExhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The error of every attempt, oldest first.
        errors: Vec<StorageError>,
    },
}

fn summarize(errors: &[StorageError]) -> String {
    errors.last().map_or_else(|| "no errors recorded".to_owned(), ToString::to_string)
}

impl StorageError {
    /// Creates a new `InvalidKey` error.
    #[must_use]
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into(), reason: reason.into() }
    }

    /// Creates a new `SizeLimitExceeded` error.
    #[must_use]
    pub fn size_limit_exceeded(kind: &'static str, actual: usize, limit: usize) -> Self {
        Self::SizeLimitExceeded { kind, actual, limit }
    }

    /// Creates a new `InvalidArgument` error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Creates a new `WrongExpectedVersion` error.
    #[must_use]
    pub fn wrong_expected_version(
        stream: impl Into<String>,
        expected: ExpectedVersionKind,
        actual: i64,
    ) -> Self {
        Self::WrongExpectedVersion { stream: stream.into(), expected, actual }
    }

    /// Creates a new `NotSupported` error.
    #[must_use]
    pub fn not_supported(operation: &'static str) -> Self {
        Self::NotSupported { operation }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `Closed` error.
    #[must_use]
    pub fn closed(component: &'static str) -> Self {
        Self::Closed { component }
    }

    /// Returns `true` for failures that may succeed when retried.
    ///
    /// Only connection failures and timeouts are transient. Precondition
    /// violations, conflicts and cancellation never are.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }

    /// Returns `true` when this error came from a caller cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source("json record", err)
    }
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::serialization_with_source("msgpack encode", err)
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::serialization_with_source("msgpack decode", err)
    }
}

/// Errors raised while validating configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// The offending field.
        field: &'static str,
        /// The smallest accepted value.
        min: String,
        /// The value supplied.
        value: String,
    },

    /// A duration or count must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// The offending field.
        field: &'static str,
        /// The value supplied.
        value: String,
    },

    /// Two fields violate a relation between them.
    #[error("{field} must be {relation}")]
    InvalidRelation {
        /// The offending field.
        field: &'static str,
        /// The relation that must hold, e.g. `"<= max_backoff"`.
        relation: String,
    },
}
