//! Session lifecycle states and close reasons.

use std::fmt;

use serde::Serialize;

use crate::envelope::{CLOSE_GOING_AWAY, CLOSE_INTERNAL, CLOSE_POLICY};

/// Where a session is in its lifecycle.
///
/// ```text
/// Connecting -> Authenticating -> ResolvingCredential -> Streaming -> Closing -> Closed
///                      |                  |                  ^  |
///                      +------------------+-> Closing        +--+ (transient error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Authenticating,
    ResolvingCredential,
    Streaming,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal move.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{Authenticating, Closed, Closing, Connecting, ResolvingCredential, Streaming};
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, ResolvingCredential)
                | (ResolvingCredential, Streaming)
                | (Streaming, Streaming)
                | (Closing, Closed)
        ) || (next == Closing && !matches!(self, Closing | Closed))
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::ResolvingCredential => "resolving_credential",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away.
    ClientDisconnected,
    /// The token was missing or rejected.
    Unauthorized(String),
    /// The stream-open budget is exhausted.
    RateLimited { retry_after_secs: u64 },
    /// The tenant has no credential for the provider.
    NotConfigured(String),
    /// The opening parameters cannot be served.
    InvalidRequest(String),
    /// The stored credential could not be decrypted or used.
    CredentialFailure(String),
    /// Any other server-side failure.
    Internal(String),
    /// The host is shutting down.
    Shutdown,
    /// Writing to the client failed.
    TransportFailed(String),
}

impl CloseReason {
    /// WebSocket close code, or `None` when the peer is already gone.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::ClientDisconnected | Self::TransportFailed(_) => None,
            Self::Unauthorized(_)
            | Self::RateLimited { .. }
            | Self::NotConfigured(_)
            | Self::InvalidRequest(_) => Some(CLOSE_POLICY),
            Self::CredentialFailure(_) | Self::Internal(_) => Some(CLOSE_INTERNAL),
            Self::Shutdown => Some(CLOSE_GOING_AWAY),
        }
    }

    /// Text of the final error envelope, if one is sent.
    ///
    /// Server-side failures get a generic message; the detail stays in logs.
    #[must_use]
    pub fn client_message(&self) -> Option<String> {
        match self {
            Self::ClientDisconnected | Self::TransportFailed(_) => None,
            Self::Unauthorized(detail) => Some(format!("Unauthorized: {detail}")),
            Self::RateLimited { retry_after_secs } => Some(format!(
                "Rate limit exceeded, retry after {retry_after_secs}s"
            )),
            Self::NotConfigured(message) | Self::InvalidRequest(message) => Some(message.clone()),
            Self::CredentialFailure(_) => Some("Stored credentials could not be used".to_owned()),
            Self::Internal(_) => Some("Internal server error".to_owned()),
            Self::Shutdown => Some("Server shutting down".to_owned()),
        }
    }

    /// Short label for logs and close frames.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::ClientDisconnected => "client disconnected",
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited { .. } => "rate limited",
            Self::NotConfigured(_) => "not configured",
            Self::InvalidRequest(_) => "invalid request",
            Self::CredentialFailure(_) => "credential failure",
            Self::Internal(_) => "internal error",
            Self::Shutdown => "shutting down",
            Self::TransportFailed(_) => "transport failed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized(d)
            | Self::NotConfigured(d)
            | Self::InvalidRequest(d)
            | Self::CredentialFailure(d)
            | Self::Internal(d)
            | Self::TransportFailed(d) => write!(f, "{}: {d}", self.label()),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "{} (retry after {retry_after_secs}s)", self.label())
            }
            Self::ClientDisconnected | Self::Shutdown => f.write_str(self.label()),
        }
    }
}
