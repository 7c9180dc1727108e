//! HTTP error types for `CloudLens` server.
//!
//! Maps domain errors from `cloudlens-core` into appropriate HTTP responses.
//! Every error variant produces a JSON body with a machine-readable `error`
//! field and a human-readable `message`.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use cloudlens_core::error::{AdmissionError, AuthError, ProviderError, VaultError};

/// Provider error codes that mean the tenant's credential lacks a permission.
const DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
    "AuthorizationFailed",
];

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid input.
    BadRequest(String),
    /// Authentication failed or token invalid.
    Unauthorized(String),
    /// The provider refused the operation for this credential.
    Forbidden(String),
    /// Requested resource not found.
    NotFound(String),
    /// Admission control rejected the request.
    RateLimited { retry_after_secs: u64 },
    /// A cloud provider call failed.
    Provider { message: String, transient: bool },
    /// Internal server error. The detail is logged, never returned.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let (status, error_type, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::RateLimited { retry_after_secs } => {
                retry_after = Some(retry_after_secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    format!("rate limit exceeded, retry after {retry_after_secs}s"),
                )
            }
            Self::Provider { message, transient } => {
                let status = if transient {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, "provider_error", message)
            }
            Self::Internal(detail) => {
                error!(error = %detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Validation { .. } => Self::BadRequest(err.to_string()),
            VaultError::NotFound { .. } => Self::NotFound(err.to_string()),
            VaultError::Crypto(ref inner) => {
                error!(error = %inner, "credential crypto failure, check CLOUDLENS_MASTER_KEY");
                Self::Internal(err.to_string())
            }
            VaultError::Storage(_) | VaultError::Corrupted { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken | AuthError::InvalidToken { .. } => {
                Self::Unauthorized(err.to_string())
            }
            AuthError::Unavailable { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::RateLimited {
                retry_after_secs, ..
            } => Self::RateLimited { retry_after_secs },
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        if DENIED_CODES.contains(&err.code.as_str()) {
            return Self::Forbidden(err.to_string());
        }
        if err.code == "Unsupported" {
            return Self::BadRequest(err.to_string());
        }
        Self::Provider {
            transient: err.transient,
            message: err.to_string(),
        }
    }
}
