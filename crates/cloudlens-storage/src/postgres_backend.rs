//! `PostgreSQL` storage backend.
//!
//! One row per `(tenant_id, provider)` in the `credential_records` table.
//! `put` is a single `INSERT .. ON CONFLICT DO UPDATE`, which gives per-key
//! atomic overwrite across any number of server processes sharing the
//! database.
//!
//! Feature-gated behind `postgres-backend`.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::{RecordKey, StorageBackend, StorageError};

/// A storage backend backed by `PostgreSQL`.
///
/// # Examples
///
/// ```no_run
/// # use cloudlens_storage::PostgresBackend;
/// # #[tokio::main]
/// # async fn main() {
/// let backend = PostgresBackend::connect("postgres://localhost/cloudlens").await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PostgresBackend {
    /// Connect to `PostgreSQL` and create the records table if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Open {
                location: "[redacted database url]".to_owned(),
                reason: e.to_string(),
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS credential_records (\
                tenant_id  TEXT        NOT NULL, \
                provider   TEXT        NOT NULL, \
                value      BYTEA       NOT NULL, \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                PRIMARY KEY (tenant_id, provider)\
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open {
            location: "credential_records".to_owned(),
            reason: format!("migration failed: {e}"),
        })?;

        Ok(Self { pool })
    }

    /// Build a backend from an existing pool. The table must already exist.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl StorageBackend for PostgresBackend {
    async fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM credential_records WHERE tenant_id = $1 AND provider = $2",
        )
        .bind(key.tenant_id())
        .bind(key.provider())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError> {
        key.validate()?;
        sqlx::query(
            "INSERT INTO credential_records (tenant_id, provider, value) VALUES ($1, $2, $3) \
             ON CONFLICT (tenant_id, provider) \
             DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key.tenant_id())
        .bind(key.provider())
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM credential_records WHERE tenant_id = $1 AND provider = $2")
            .bind(key.tenant_id())
            .bind(key.provider())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<RecordKey>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT provider FROM credential_records WHERE tenant_id = $1 ORDER BY provider",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::List {
            tenant_id: tenant_id.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(rows
            .into_iter()
            .map(|(provider,)| RecordKey::new(tenant_id, provider))
            .collect())
    }

    async fn exists(&self, key: &RecordKey) -> Result<bool, StorageError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM credential_records WHERE tenant_id = $1 AND provider = $2)",
        )
        .bind(key.tenant_id())
        .bind(key.provider())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        Ok(exists)
    }
}
