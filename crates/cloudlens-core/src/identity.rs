//! Caller identity.
//!
//! Token issuance and validation belong to an external identity service.
//! This crate only consumes the result: an opaque bearer token goes in, a
//! [`Principal`] naming the tenant comes out.

use serde::Serialize;

use crate::error::AuthError;

/// A verified caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Principal {
    /// Stable tenant identifier (the token subject).
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Remaining claims, passed through untouched.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl Principal {
    /// A principal with only a tenant id.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            email: None,
            roles: Vec::new(),
            claims: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Verifies bearer tokens against the identity service.
#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify `token` and return the caller it names.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] for any token that fails
    /// verification and [`AuthError::Unavailable`] if the service cannot
    /// be consulted.
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}
