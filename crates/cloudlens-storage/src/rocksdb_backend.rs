//! `RocksDB` storage backend for single-node persistent deployments.
//!
//! All operations are dispatched to a blocking thread via
//! [`tokio::task::spawn_blocking`] since `RocksDB` is a synchronous C++ library.
//! Keys are flattened to `tenant_id \0 provider` so that a tenant's records
//! are contiguous and can be listed with a forward prefix scan.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};

use crate::{RecordKey, StorageBackend, StorageError};

type Db = DBWithThreadMode<MultiThreaded>;

const SEPARATOR: u8 = 0;

/// A storage backend backed by `RocksDB`.
///
/// # Examples
///
/// ```no_run
/// # use cloudlens_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/cloudlens/data").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open a `RocksDB` database at the given path, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` fails to open the database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, path).map_err(|e| StorageError::Open {
            location: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Return the filesystem path of this database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn tenant_prefix(tenant_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(tenant_id.len().saturating_add(1));
    prefix.extend_from_slice(tenant_id.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

fn encode(key: &RecordKey) -> Result<Vec<u8>, StorageError> {
    key.validate()?;
    let mut raw = tenant_prefix(key.tenant_id());
    raw.extend_from_slice(key.provider().as_bytes());
    Ok(raw)
}

fn decode(tenant_id: &str, raw: &[u8]) -> Result<RecordKey, StorageError> {
    let provider_bytes = raw.get(tenant_id.len().saturating_add(1)..).unwrap_or_default();
    let provider =
        String::from_utf8(provider_bytes.to_vec()).map_err(|e| StorageError::InvalidKey {
            reason: e.to_string(),
        })?;
    Ok(RecordKey::new(tenant_id, provider))
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError> {
        let db = Arc::clone(&self.db);
        let raw = encode(key)?;
        let label = key.to_string();
        tokio::task::spawn_blocking(move || {
            db.get(&raw).map_err(|e| StorageError::Read {
                key: label,
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Read {
            key: key.to_string(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let raw = encode(key)?;
        let label = key.to_string();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || {
            db.put(&raw, &value).map_err(|e| StorageError::Write {
                key: label,
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_string(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let raw = encode(key)?;
        let label = key.to_string();
        tokio::task::spawn_blocking(move || {
            db.delete(&raw).map_err(|e| StorageError::Delete {
                key: label,
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Delete {
            key: key.to_string(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<RecordKey>, StorageError> {
        let db = Arc::clone(&self.db);
        let tenant = tenant_id.to_owned();
        tokio::task::spawn_blocking(move || {
            let prefix = tenant_prefix(&tenant);
            let iter = db.iterator(IteratorMode::From(&prefix, Direction::Forward));

            let mut keys = Vec::new();
            for item in iter {
                let (raw, _) = item.map_err(|e| StorageError::List {
                    tenant_id: tenant.clone(),
                    reason: e.to_string(),
                })?;
                if !raw.starts_with(&prefix) {
                    break;
                }
                keys.push(decode(&tenant, &raw)?);
            }
            Ok(keys)
        })
        .await
        .map_err(|e| StorageError::List {
            tenant_id: tenant_id.to_owned(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }
}
