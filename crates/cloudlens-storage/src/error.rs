//! Storage error types.
//!
//! Every variant names the record it concerns so failures can be diagnosed
//! from a log line alone. Values are never included.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open or connect to the storage backend.
    #[error("failed to open storage at '{location}': {reason}")]
    Open { location: String, reason: String },

    /// Failed to read a record.
    #[error("failed to read record '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a record.
    #[error("failed to write record '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to delete a record.
    #[error("failed to delete record '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// Failed to list records for a tenant.
    #[error("failed to list records for tenant '{tenant_id}': {reason}")]
    List { tenant_id: String, reason: String },

    /// A key component cannot be represented by this backend.
    #[error("invalid record key: {reason}")]
    InvalidKey { reason: String },
}
