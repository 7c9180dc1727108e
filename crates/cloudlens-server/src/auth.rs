//! Bearer token authentication and admission for REST routes.
//!
//! Tokens are HS256 JWTs issued by the identity service. The `sub` claim is
//! the tenant id. [`require_identity`] verifies the token, charges the
//! caller's bucket for the route's endpoint class, and injects the
//! [`Principal`] into request extensions. Admission runs before any handler
//! touches the vault.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::{debug, warn};

use cloudlens_core::admission::EndpointClass;
use cloudlens_core::error::AuthError;
use cloudlens_core::identity::{IdentityVerifier, Principal};

use crate::config::JwtConfig;
use crate::error::AppError;
use crate::state::AppState;

/// Claims the verifier understands. Everything else lands in `rest`.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

/// Verifies HS256 bearer tokens with a shared secret.
pub struct JwtVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("configured", &self.key.is_some())
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    #[must_use]
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        let key = config
            .secret
            .as_ref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()));
        if key.is_none() {
            warn!("CLOUDLENS_JWT_SECRET not set, every bearer token will be rejected");
        }
        Self { key, validation }
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let Some(key) = &self.key else {
            return Err(AuthError::InvalidToken {
                reason: "token verification is not configured".to_owned(),
            });
        };
        let data = decode::<Claims>(token, key, &self.validation).map_err(|e| {
            debug!(error = %e, "bearer token rejected");
            AuthError::InvalidToken {
                reason: e.to_string(),
            }
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken {
                reason: "empty subject".to_owned(),
            });
        }
        Ok(Principal {
            tenant_id: claims.sub,
            email: claims.email,
            roles: claims.roles,
            claims: claims.rest,
        })
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Middleware that authenticates the caller and applies admission control
/// for `class`.
///
/// # Errors
///
/// Returns `401` for a missing or invalid token and `429` when the
/// caller's bucket is empty.
pub async fn require_identity(
    State((state, class)): State<(Arc<AppState>, EndpointClass)>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(&req).ok_or(AuthError::MissingToken)?;
    let principal = state.verifier.verify(token).await?;
    state.admission.check(class, &principal.tenant_id)?;

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
