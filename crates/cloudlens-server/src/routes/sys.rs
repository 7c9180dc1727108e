//! System routes: `/v1/sys/*`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Build the `/v1/sys` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub vault_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub active_sessions: usize,
}

/// Liveness plus the two facts an operator checks first. A missing master
/// key degrades the server but does not fail the probe.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let vault_key = state.vault.has_key();
    let status = match (vault_key, state.sessions.is_shutting_down()) {
        (_, true) => "draining",
        (false, false) => "degraded",
        (true, false) => "ok",
    };
    Json(HealthResponse {
        status,
        vault_key,
        key_id: state.vault.key_id(),
        active_sessions: state.sessions.active_count(),
    })
}
