//! Key/value storage capability consumed by the messenger.
//!
//! Storage is organized in physical units (one per user) holding nested
//! buckets of keys. A bucket is addressed by its path, outermost first, so
//! `["messages", "inbox"]` is the inbox bucket nested in the messages
//! container.

mod memory;
mod sled_store;

pub use self::memory::{MemoryProvider, MemoryStorage};
pub use self::sled_store::{SledProvider, SledStorage, DEFAULT_MAX_OPEN_UNITS};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Separator used when flattening a bucket path into a single name.
pub const PATH_SEPARATOR: char = '/';

/// Units whose name starts with this belong to the server, never to a user.
pub const RESERVED_UNIT_PREFIX: char = '_';

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key does not exist (only returned by `update`).
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Bucket path or unit name is unusable.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Embedded database error.
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other backend error.
    #[error("{0}")]
    Backend(String),
}

/// One physical storage unit.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a value. Returns `None` if the key is absent.
    async fn get(&self, buckets: &[&str], key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a value, replacing any existing one.
    async fn create(&self, buckets: &[&str], key: &str, value: Vec<u8>)
        -> Result<(), StorageError>;

    /// Replace an existing value.
    ///
    /// Fails with `NotFound` if the key is absent.
    async fn update(&self, buckets: &[&str], key: &str, value: Vec<u8>)
        -> Result<(), StorageError>;

    /// Remove a value. Removing an absent key is not an error.
    async fn delete(&self, buckets: &[&str], key: &str) -> Result<(), StorageError>;

    /// List every key/value pair in a bucket, ordered by key.
    async fn list(&self, buckets: &[&str]) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Move a value from one bucket to another.
    ///
    /// Returns `false` if `src` does not hold `key`, leaving `dst` untouched.
    ///
    /// The default is a read, a write into `dst`, then a delete from `src`.
    /// A fault between the write and the delete leaves the value in both
    /// buckets: at-least-once, never lost. Backends with transactions
    /// override this with an atomic move.
    async fn move_value(
        &self,
        src: &[&str],
        dst: &[&str],
        key: &str,
    ) -> Result<bool, StorageError> {
        let Some(value) = self.get(src, key).await? else {
            return Ok(false);
        };
        self.create(dst, key, value).await?;
        self.delete(src, key).await?;
        Ok(true)
    }
}

/// Opens physical storage units by name.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Open (or create) the unit. The same name always addresses the same
    /// unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit name is invalid or the backend fails.
    async fn open(&self, unit: &str) -> Result<Arc<dyn Storage>, StorageError>;
}

/// Flatten a bucket path into a single name.
///
/// # Errors
///
/// Returns an error if the path is empty or a segment is empty or contains
/// the separator.
pub fn bucket_path(buckets: &[&str]) -> Result<String, StorageError> {
    if buckets.is_empty() {
        return Err(StorageError::InvalidPath("empty bucket path".into()));
    }
    for bucket in buckets {
        if bucket.is_empty() || bucket.contains(PATH_SEPARATOR) {
            return Err(StorageError::InvalidPath(format!("bad bucket {bucket:?}")));
        }
    }
    Ok(buckets.join("/"))
}

/// Validate a storage unit name.
///
/// Units map to files for on-disk backends, so names must not escape the
/// storage directory.
///
/// # Errors
///
/// Returns an error if the name is empty, a dot entry, or contains a path
/// separator.
pub fn validate_unit_name(unit: &str) -> Result<(), StorageError> {
    if unit.is_empty() || unit == "." || unit == ".." {
        return Err(StorageError::InvalidPath(format!("bad unit {unit:?}")));
    }
    if unit.contains(['/', '\\', '\0']) {
        return Err(StorageError::InvalidPath(format!("bad unit {unit:?}")));
    }
    Ok(())
}

/// Validate the name of a user's storage unit.
///
/// # Errors
///
/// Returns an error if the name is not a valid unit name or starts with
/// [`RESERVED_UNIT_PREFIX`].
pub fn validate_user_unit(user_id: &str) -> Result<(), StorageError> {
    validate_unit_name(user_id)?;
    if user_id.starts_with(RESERVED_UNIT_PREFIX) {
        return Err(StorageError::InvalidPath(format!("reserved unit {user_id:?}")));
    }
    Ok(())
}
