//! Storage backend abstraction for `CloudLens`.
//!
//! This crate defines the [`StorageBackend`] trait, a keyed record store that
//! knows nothing about providers, encryption, or sessions. The credential
//! vault in `cloudlens-core` seals every sensitive field before a record
//! reaches this layer, so backends only ever see ciphertext for secrets.
//!
//! Records are addressed by a composite [`RecordKey`] of
//! `(tenant_id, provider)`. Writes overwrite atomically per key; there is no
//! multi-key transaction guarantee.
//!
//! Implementations:
//!
//! - [`MemoryBackend`]: sharded in-memory map, for development and tests
//! - [`RocksDbBackend`]: embedded persistent store (feature `rocksdb-backend`)
//! - [`PostgresBackend`]: shared store for multi-process deployments (feature `postgres-backend`)

mod error;
mod key;
mod memory;
#[cfg(feature = "postgres-backend")]
mod postgres_backend;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use error::StorageError;
pub use key::RecordKey;
pub use memory::MemoryBackend;
#[cfg(feature = "postgres-backend")]
pub use postgres_backend::PostgresBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A pluggable keyed record store.
///
/// Values are opaque byte arrays. Operations on distinct keys are
/// independent; operations on the same key are last-writer-wins, relying on
/// the backend's native per-key atomicity rather than an in-process lock.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a record by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a record, overwriting any existing value for the key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a record. Deleting a non-existent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &RecordKey) -> Result<(), StorageError>;

    /// List every key belonging to a tenant, ordered by provider.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, tenant_id: &str) -> Result<Vec<RecordKey>, StorageError>;

    /// Check whether a key exists.
    ///
    /// The default implementation calls [`get`](StorageBackend::get) and checks
    /// for `Some`. Backends may override this with a cheaper check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &RecordKey) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
