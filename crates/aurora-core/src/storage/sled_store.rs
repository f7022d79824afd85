//! On-disk storage backend using sled.
//!
//! Each unit is its own sled database at `<dir>/<unit><extension>`. Each
//! bucket path is a tree named after the flattened path. sled calls block,
//! so every one of them runs on the blocking thread pool.

use super::{bucket_path, validate_unit_name, Storage, StorageError, StorageProvider};
use async_trait::async_trait;
use dashmap::DashMap;
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default number of databases a provider keeps open.
pub const DEFAULT_MAX_OPEN_UNITS: usize = 256;

/// Run a blocking storage call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Backend(format!("storage task failed: {e}")))?
}

/// A storage unit backed by one sled database.
#[derive(Debug, Clone)]
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Open or create the database at `path`.
    ///
    /// This blocks; async callers go through [`SledProvider`].
    ///
    /// # Errors
    ///
    /// Returns an error if sled cannot open the database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Run `f` on the tree of a bucket path, on the blocking pool.
    async fn with_tree<T, F>(&self, buckets: &[&str], f: F) -> Result<T, StorageError>
    where
        F: FnOnce(sled::Tree) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let path = bucket_path(buckets)?;
        let db = self.db.clone();
        blocking(move || f(db.open_tree(path)?)).await
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn get(&self, buckets: &[&str], key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_string();
        self.with_tree(buckets, move |tree| {
            Ok(tree.get(key.as_bytes())?.map(|v| v.to_vec()))
        })
        .await
    }

    async fn create(
        &self,
        buckets: &[&str],
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        let key = key.to_string();
        self.with_tree(buckets, move |tree| {
            tree.insert(key.as_bytes(), value)?;
            tree.flush()?;
            Ok(())
        })
        .await
    }

    async fn update(
        &self,
        buckets: &[&str],
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        let key = key.to_string();
        self.with_tree(buckets, move |tree| {
            // Compare-and-swap keeps the existence check and the write together.
            let current = tree
                .get(key.as_bytes())?
                .ok_or_else(|| StorageError::NotFound(key.clone()))?;
            tree.compare_and_swap(key.as_bytes(), Some(current), Some(value))?
                .map_err(|_| StorageError::Backend(format!("concurrent update of {key}")))?;
            tree.flush()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, buckets: &[&str], key: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        self.with_tree(buckets, move |tree| {
            tree.remove(key.as_bytes())?;
            tree.flush()?;
            Ok(())
        })
        .await
    }

    async fn list(&self, buckets: &[&str]) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.with_tree(buckets, |tree| {
            tree.iter()
                .map(|item| {
                    let (k, v) = item?;
                    Ok((String::from_utf8_lossy(&k).into_owned(), v.to_vec()))
                })
                .collect()
        })
        .await
    }

    /// Atomic move using a two-tree transaction.
    async fn move_value(
        &self,
        src: &[&str],
        dst: &[&str],
        key: &str,
    ) -> Result<bool, StorageError> {
        let src_path = bucket_path(src)?;
        let dst_path = bucket_path(dst)?;
        let key = key.to_string();
        let db = self.db.clone();

        blocking(move || {
            let src_tree = db.open_tree(&src_path)?;
            if src_path == dst_path {
                return Ok(src_tree.contains_key(key.as_bytes())?);
            }
            let dst_tree = db.open_tree(&dst_path)?;

            let moved = (&src_tree, &dst_tree)
                .transaction(|(s, d)| -> ConflictableTransactionResult<bool, ()> {
                    let Some(value) = s.get(key.as_bytes())? else {
                        return Ok(false);
                    };
                    d.insert(key.as_bytes(), value)?;
                    s.remove(key.as_bytes())?;
                    Ok(true)
                })
                .map_err(|e| match e {
                    TransactionError::Storage(e) => StorageError::Sled(e),
                    TransactionError::Abort(()) => StorageError::Backend("move aborted".into()),
                })?;

            if moved {
                db.flush()?;
            }
            Ok(moved)
        })
        .await
    }
}

/// An open unit and when it was last handed out.
#[derive(Debug)]
struct CachedUnit {
    storage: Arc<SledStorage>,
    last_used: AtomicU64,
}

impl CachedUnit {
    /// Nobody outside the cache holds the unit.
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.storage) == 1
    }
}

/// Opens one sled database per unit under a directory.
///
/// sled holds an exclusive lock on each database, so opened units are cached
/// and shared. At most `capacity` units stay open: when a new one is needed,
/// the least recently used unit that nobody holds is closed first. Units in
/// use are never closed, so the cache can briefly exceed its capacity.
#[derive(Debug)]
pub struct SledProvider {
    dir: PathBuf,
    extension: String,
    capacity: usize,
    units: DashMap<String, CachedUnit>,
    clock: AtomicU64,
    /// Serializes opening and closing so a database is never opened twice.
    opening: Mutex<()>,
}

impl SledProvider {
    /// Create a provider rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!("Sled storage rooted at {}", dir.display());
        Ok(Self {
            dir,
            extension: extension.into(),
            capacity: DEFAULT_MAX_OPEN_UNITS,
            units: DashMap::new(),
            clock: AtomicU64::new(0),
            opening: Mutex::new(()),
        })
    }

    /// Set how many databases may stay open at once.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Path of the database file for a unit.
    #[must_use]
    pub fn unit_path(&self, unit: &str) -> PathBuf {
        self.dir.join(format!("{}{}", unit, self.extension))
    }

    /// Number of databases currently open.
    #[must_use]
    pub fn open_units(&self) -> usize {
        self.units.len()
    }

    fn cached(&self, unit: &str) -> Option<Arc<SledStorage>> {
        let cached = self.units.get(unit)?;
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        cached.last_used.store(tick, Ordering::Relaxed);
        Some(Arc::clone(&cached.storage))
    }

    /// Remove the least recently used idle unit from the cache.
    fn take_idle(&self) -> Option<(String, CachedUnit)> {
        let victim = self
            .units
            .iter()
            .filter(|entry| entry.is_idle())
            .min_by_key(|entry| entry.last_used.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone())?;
        // Re-checked under the shard lock; the unit may have been handed out.
        self.units.remove_if(&victim, |_, unit| unit.is_idle())
    }
}

#[async_trait]
impl StorageProvider for SledProvider {
    async fn open(&self, unit: &str) -> Result<Arc<dyn Storage>, StorageError> {
        validate_unit_name(unit)?;

        if let Some(storage) = self.cached(unit) {
            return Ok(storage);
        }

        let _opening = self.opening.lock().await;
        if let Some(storage) = self.cached(unit) {
            return Ok(storage);
        }

        while self.units.len() >= self.capacity {
            let Some((name, evicted)) = self.take_idle() else {
                warn!(open = self.units.len(), capacity = self.capacity, "All open units busy");
                break;
            };
            debug!(unit = %name, "Closing idle storage unit");
            // Dropping the database flushes it and releases its file lock.
            blocking(move || {
                drop(evicted);
                Ok(())
            })
            .await?;
        }

        let path = self.unit_path(unit);
        debug!(unit = %unit, path = %path.display(), "Opening storage unit");
        let storage = Arc::new(blocking(move || SledStorage::open(path)).await?);

        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        self.units.insert(
            unit.to_string(),
            CachedUnit {
                storage: Arc::clone(&storage),
                last_used: AtomicU64::new(tick),
            },
        );
        Ok(storage)
    }
}
