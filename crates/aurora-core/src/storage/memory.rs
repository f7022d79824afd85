//! In-process storage backend.

use super::{bucket_path, validate_unit_name, Storage, StorageError, StorageProvider};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A storage unit held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Buckets by flattened path.
    buckets: DashMap<String, BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty unit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, buckets: &[&str], key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = bucket_path(buckets)?;
        Ok(self
            .buckets
            .get(&path)
            .and_then(|bucket| bucket.get(key).cloned()))
    }

    async fn create(
        &self,
        buckets: &[&str],
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        let path = bucket_path(buckets)?;
        self.buckets
            .entry(path)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn update(
        &self,
        buckets: &[&str],
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        let path = bucket_path(buckets)?;
        let mut bucket = self
            .buckets
            .get_mut(&path)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        match bucket.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, buckets: &[&str], key: &str) -> Result<(), StorageError> {
        let path = bucket_path(buckets)?;
        if let Some(mut bucket) = self.buckets.get_mut(&path) {
            bucket.remove(key);
        }
        Ok(())
    }

    async fn list(&self, buckets: &[&str]) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let path = bucket_path(buckets)?;
        Ok(self
            .buckets
            .get(&path)
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Hands out one `MemoryStorage` per unit name.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    units: DashMap<String, Arc<MemoryStorage>>,
}

impl MemoryProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of units opened so far.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    async fn open(&self, unit: &str) -> Result<Arc<dyn Storage>, StorageError> {
        validate_unit_name(unit)?;
        let storage = self
            .units
            .entry(unit.to_string())
            .or_insert_with(|| Arc::new(MemoryStorage::new()))
            .clone();
        Ok(storage)
    }
}
