//! Key and value size validation.
//!
//! Limits come from the backend's [`Features`]. The validating behavior calls
//! [`validate_entry`] on every write and [`validate_key`] on reads and deletes.
//!
//! # Defaults
//!
//! | Limit | Default |
//! |-------|---------|
//! | `max_key_length` | 512 bytes |
//! | `max_value_size` | 524 288 bytes (512 KiB) |

use crate::{StorageError, types::Entry, types::Features};

/// Default maximum key size in bytes (512 B).
pub const DEFAULT_MAX_KEY_SIZE: usize = 512;

/// Default maximum value size in bytes (512 KiB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 512 * 1024;

/// Validates a key against the backend limits.
///
/// Empty keys are always rejected.
pub fn validate_key(key: &str, features: &Features) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::invalid_key(key, "key must not be empty"));
    }
    if key.len() > features.max_key_length {
        return Err(StorageError::size_limit_exceeded("key", key.len(), features.max_key_length));
    }
    Ok(())
}

/// Validates an entry's key and value against the backend limits.
///
/// A stored null counts as a zero-length value.
pub fn validate_entry(entry: &Entry, features: &Features) -> Result<(), StorageError> {
    validate_key(&entry.key, features)?;
    let len = entry.value_len();
    if len > features.max_value_size {
        return Err(StorageError::size_limit_exceeded("value", len, features.max_value_size));
    }
    Ok(())
}
