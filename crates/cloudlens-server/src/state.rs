//! Shared application state for `CloudLens` server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It holds the credential vault, the identity
//! verifier, the adapter factory, admission control, and the session
//! manager that owns every open stream.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cloudlens_core::admission::AdmissionControl;
use cloudlens_core::identity::IdentityVerifier;
use cloudlens_core::provider::{AdapterFactory, CallPolicy};
use cloudlens_core::session::{SessionConfig, SessionManager};
use cloudlens_core::vault::CredentialVault;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Encrypted per-tenant credential records.
    pub vault: Arc<CredentialVault>,
    /// Bearer token verification.
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Builds provider adapters from decrypted credentials.
    pub adapters: Arc<dyn AdapterFactory>,
    /// Per-identity token buckets.
    pub admission: Arc<AdmissionControl>,
    /// Open stream sessions.
    pub sessions: Arc<SessionManager>,
    /// Timeout and retry for REST-initiated provider calls.
    pub call_policy: CallPolicy,
    /// Role required for provider mutations. `None` admits any caller.
    pub mutation_role: Option<String>,
}

impl AppState {
    /// Wire the subsystems together. Cancelling `shutdown` closes every
    /// stream session with "going away".
    #[must_use]
    pub fn new(
        vault: Arc<CredentialVault>,
        verifier: Arc<dyn IdentityVerifier>,
        adapters: Arc<dyn AdapterFactory>,
        admission: Arc<AdmissionControl>,
        session: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let call_policy = session.call_policy;
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&verifier),
            Arc::clone(&vault),
            Arc::clone(&adapters),
            Arc::clone(&admission),
            session,
            shutdown,
        ));
        Self {
            vault,
            verifier,
            adapters,
            admission,
            sessions,
            call_policy,
            mutation_role: None,
        }
    }

    /// Require `role` on scale and firewall calls.
    #[must_use]
    pub fn with_mutation_role(mut self, role: Option<String>) -> Self {
        self.mutation_role = role;
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("sessions", &self.sessions.active_count())
            .finish_non_exhaustive()
    }
}
