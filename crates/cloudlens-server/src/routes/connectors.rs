//! Connector management routes: `/v1/connectors/*`, `/v1/account`, `/v1/profile`
//!
//! Connecting validates the submitted fields against the provider before
//! anything is written, so a stored credential is always one that worked.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use tracing::info;

use cloudlens_core::credential::{Credential, Identity, ProviderKind};
use cloudlens_core::identity::Principal;
use cloudlens_core::provider::invoke;

use super::parse_provider;
use crate::error::AppError;
use crate::state::AppState;

/// Read-only connector routes.
pub fn read_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/connectors/status", get(status))
        .route("/v1/profile", get(profile))
}

/// Routes that change stored credentials.
pub fn write_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/connectors/{provider}", post(connect).delete(disconnect))
        .route("/v1/account", delete(delete_account))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub msg: String,
    pub provider: ProviderKind,
    pub identity: Identity,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub aws: bool,
    pub azure: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteAccountResponse {
    pub deleted: usize,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub roles: Vec<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Validate and store a credential for `provider`.
async fn connect(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(provider): Path<String>,
    Json(fields): Json<BTreeMap<String, String>>,
) -> Result<Json<ConnectResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    if !state.vault.has_key() {
        return Err(AppError::Internal(
            "credential storage is unavailable: no master key loaded".to_owned(),
        ));
    }

    let credential = Credential::new(principal.tenant_id.as_str(), provider, fields)?;
    let adapter = state.adapters.build(&credential)?;
    let identity = invoke(&state.call_policy, "validate_credential", || {
        adapter.validate_credential()
    })
    .await
    .map_err(|e| {
        if e.transient {
            AppError::from(e)
        } else {
            AppError::BadRequest(format!("credential rejected by {}: {}", provider.display_name(), e.message))
        }
    })?;
    drop(adapter);

    let credential = credential.with_identity(identity.clone());
    state.vault.store(&credential).await?;
    info!(
        tenant_id = %principal.tenant_id,
        provider = provider.as_str(),
        account_id = %identity.account_id,
        "connector stored"
    );

    Ok(Json(ConnectResponse {
        msg: format!("{} connector saved", provider.display_name()),
        provider,
        identity,
    }))
}

/// Remove the credential for `provider`. Succeeds whether or not one existed.
async fn disconnect(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(provider): Path<String>,
) -> Result<StatusCode, AppError> {
    let provider = parse_provider(&provider)?;
    state.vault.delete(&principal.tenant_id, provider).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Which providers the caller has connected.
async fn status(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<StatusResponse>, AppError> {
    let connected = state.vault.providers(&principal.tenant_id).await?;
    Ok(Json(StatusResponse {
        aws: connected.contains(&ProviderKind::Aws),
        azure: connected.contains(&ProviderKind::Azure),
    }))
}

/// Delete every credential the caller owns.
async fn delete_account(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<DeleteAccountResponse>, AppError> {
    let deleted = state.vault.delete_tenant(&principal.tenant_id).await?;
    info!(tenant_id = %principal.tenant_id, deleted, "account deleted");
    Ok(Json(DeleteAccountResponse { deleted }))
}

async fn profile(Extension(principal): Extension<Principal>) -> Json<ProfileResponse> {
    Json(ProfileResponse {
        tenant_id: principal.tenant_id,
        email: principal.email,
        roles: principal.roles,
    })
}
