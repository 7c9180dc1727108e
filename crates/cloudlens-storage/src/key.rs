//! Composite record keys.

use std::fmt;

use crate::StorageError;

/// Composite key `(tenant_id, provider)` addressing one credential record.
///
/// The provider component is the lowercase provider name (`aws`, `azure`).
/// The storage layer treats both components as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    tenant_id: String,
    provider: String,
}

impl RecordKey {
    /// Build a key from its two components.
    pub fn new(tenant_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            provider: provider.into(),
        }
    }

    /// The owning tenant.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The provider component.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Reject components that byte-oriented backends cannot encode.
    ///
    /// NUL separates the components in flat keyspaces, so neither part may
    /// contain it, and neither may be empty.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for empty or NUL-bearing parts.
    pub fn validate(&self) -> Result<(), StorageError> {
        for (name, part) in [("tenant_id", &self.tenant_id), ("provider", &self.provider)] {
            if part.is_empty() {
                return Err(StorageError::InvalidKey {
                    reason: format!("{name} must not be empty"),
                });
            }
            if part.contains('\0') {
                return Err(StorageError::InvalidKey {
                    reason: format!("{name} must not contain NUL bytes"),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_components() {
        let key = RecordKey::new("u1", "aws");
        assert_eq!(key.to_string(), "u1/aws");
    }

    #[test]
    fn validate_rejects_empty_and_nul() {
        assert!(RecordKey::new("", "aws").validate().is_err());
        assert!(RecordKey::new("u1", "").validate().is_err());
        assert!(RecordKey::new("u\01", "aws").validate().is_err());
        assert!(RecordKey::new("google-oauth2|123", "azure").validate().is_ok());
    }
}
