//! HTTP and WebSocket routes.
//!
//! REST groups sit behind [`require_identity`] with the admission class that
//! fits them. The stream endpoint authenticates inside the session, and the
//! health route is open.

pub mod connectors;
pub mod stream;
pub mod sys;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::middleware as axum_mw;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use cloudlens_core::admission::EndpointClass;
use cloudlens_core::credential::ProviderKind;
use cloudlens_core::error::VaultError;
use cloudlens_core::provider::ProviderAdapter;

use crate::auth::require_identity;
use crate::error::AppError;
use crate::state::AppState;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let rest_routes = Router::new()
        .merge(connectors::read_router())
        .merge(telemetry::read_router())
        .route_layer(axum_mw::from_fn_with_state(
            (Arc::clone(&state), EndpointClass::Rest),
            require_identity,
        ));

    let mutation_routes = Router::new()
        .merge(connectors::write_router())
        .merge(telemetry::write_router())
        .route_layer(axum_mw::from_fn_with_state(
            (Arc::clone(&state), EndpointClass::Mutation),
            require_identity,
        ));

    // Health is probed often; cap how many run at once.
    let sys_routes = Router::new()
        .nest("/v1/sys", sys::router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(32));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .merge(sys_routes)
        .merge(rest_routes)
        .merge(mutation_routes)
        .merge(stream::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// Parse the `{provider}` path segment.
pub(crate) fn parse_provider(raw: &str) -> Result<ProviderKind, AppError> {
    raw.parse::<ProviderKind>()
        .map_err(|_| AppError::NotFound(format!("unknown provider '{raw}'")))
}

/// Decrypt the tenant's credential for `provider` and build its adapter.
///
/// The credential is dropped before this returns; only the adapter's own
/// copy of the secret survives, for as long as the caller holds it.
pub(crate) async fn adapter_for(
    state: &AppState,
    tenant_id: &str,
    provider: ProviderKind,
) -> Result<Arc<dyn ProviderAdapter>, AppError> {
    let credential = match state.vault.get(tenant_id, provider).await {
        Ok(credential) => credential,
        Err(VaultError::NotFound { .. }) => {
            return Err(AppError::NotFound(format!(
                "No {} connector found for this account",
                provider.display_name()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(state.adapters.build(&credential)?)
}
