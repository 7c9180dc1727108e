//! Error types for `cloudlens-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. No variant ever carries credential plaintext or key material,
//! only tenant ids, provider names, field names and key fingerprints.

use std::time::Duration;

use cloudlens_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// No master key was loaded at startup.
    #[error("encryption key unavailable")]
    KeyUnavailable,

    /// The master key could not be parsed.
    #[error("invalid encryption key: {reason}")]
    InvalidKey { reason: String },

    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// The record was sealed under a different key than the one loaded.
    #[error("record sealed with key {actual}, loaded key is {expected}")]
    KeyMismatch { expected: String, actual: String },
}

/// Errors from the credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The supplied credential fields are malformed or incomplete.
    #[error("invalid credential: {reason}")]
    Validation { reason: String },

    /// No credential is stored for this pair.
    #[error("no {provider} credential for tenant '{tenant_id}'")]
    NotFound { tenant_id: String, provider: String },

    /// Sealing or unsealing a field failed.
    #[error("vault crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The storage backend returned an error.
    #[error("vault storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stored record could not be interpreted.
    #[error("corrupted record for '{key}': {reason}")]
    Corrupted { key: String, reason: String },
}

/// A normalized failure from a cloud provider call.
///
/// `transient` failures (throttling, timeouts, 5xx) are retried once and
/// reported to the client without ending a stream. Everything else is
/// permanent for the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    /// Short machine-readable code, e.g. `Throttling` or `AccessDenied`.
    pub code: String,
    /// Human-readable description with no credential material.
    pub message: String,
    /// Whether a retry could plausibly succeed.
    pub transient: bool,
}

impl ProviderError {
    /// A failure worth one more attempt.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// A failure that will not resolve on retry.
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// The call exceeded its deadline.
    #[must_use]
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::transient(
            "Timeout",
            format!("{operation} did not complete within {}ms", after.as_millis()),
        )
    }

    /// The adapter does not implement this operation.
    #[must_use]
    pub fn unsupported(provider: &str, operation: &str) -> Self {
        Self::permanent(
            "Unsupported",
            format!("{operation} is not supported for {provider}"),
        )
    }
}

/// Errors from bearer token verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("missing bearer token")]
    MissingToken,

    /// The token failed verification.
    #[error("invalid token: {reason}")]
    InvalidToken { reason: String },

    /// The identity service could not be reached.
    #[error("identity verifier unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors from admission control.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The caller exhausted its budget for this endpoint class.
    #[error("rate limit exceeded for {class}, retry after {retry_after_secs}s")]
    RateLimited {
        class: &'static str,
        retry_after_secs: u64,
    },
}

/// Errors from a bidirectional stream transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer is gone.
    #[error("transport closed")]
    Closed,

    /// A frame could not be written.
    #[error("transport send failed: {reason}")]
    Send { reason: String },
}
