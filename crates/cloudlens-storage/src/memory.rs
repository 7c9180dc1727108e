//! In-memory storage backend.
//!
//! Records live in a sharded `DashMap`, so readers and writers on different
//! keys do not contend on a single lock. Nothing is persisted: all data is
//! lost when the process exits.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{RecordKey, StorageBackend, StorageError};

/// An in-memory storage backend backed by a sharded concurrent map.
///
/// Clones share the same underlying map.
///
/// # Examples
///
/// ```
/// # use cloudlens_storage::{MemoryBackend, RecordKey, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// let key = RecordKey::new("u1", "aws");
/// backend.put(&key, b"sealed").await.unwrap();
/// assert_eq!(backend.get(&key).await.unwrap(), Some(b"sealed".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: Arc<DashMap<RecordKey, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the backend holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError> {
        key.validate()?;
        self.records.insert(key.clone(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.records.remove(key);
        Ok(())
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<RecordKey>, StorageError> {
        let mut keys: Vec<RecordKey> = self
            .records
            .iter()
            .filter(|entry| entry.key().tenant_id() == tenant_id)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &RecordKey) -> Result<bool, StorageError> {
        Ok(self.records.contains_key(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let backend = MemoryBackend::new();
        let result = backend.get(&RecordKey::new("u1", "aws")).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let backend = MemoryBackend::new();
        let key = RecordKey::new("u1", "aws");
        backend.put(&key, b"v1").await.unwrap();
        backend.put(&key, b"v2").await.unwrap();
        assert_eq!(backend.get(&key).await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn put_rejects_invalid_key() {
        let backend = MemoryBackend::new();
        let result = backend.put(&RecordKey::new("", "aws"), b"v").await;
        assert!(matches!(result, Err(StorageError::InvalidKey { .. })));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        let key = RecordKey::new("u1", "aws");
        backend.put(&key, b"val").await.unwrap();
        backend.delete(&key).await.unwrap();
        backend.delete(&key).await.unwrap();
        assert!(!backend.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn list_is_scoped_to_tenant() {
        let backend = MemoryBackend::new();
        backend.put(&RecordKey::new("u1", "azure"), b"1").await.unwrap();
        backend.put(&RecordKey::new("u1", "aws"), b"2").await.unwrap();
        backend.put(&RecordKey::new("u2", "aws"), b"3").await.unwrap();

        let keys = backend.list("u1").await.unwrap();
        assert_eq!(
            keys,
            vec![RecordKey::new("u1", "aws"), RecordKey::new("u1", "azure")]
        );
        assert!(backend.list("u3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_writers_on_distinct_keys() {
        let backend = MemoryBackend::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let key = RecordKey::new(format!("tenant-{i}"), "aws");
                backend.put(&key, format!("{i}").as_bytes()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(backend.len(), 32);
    }
}
