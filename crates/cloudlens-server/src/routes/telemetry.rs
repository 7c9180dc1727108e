//! Provider telemetry and mutation routes: `/v1/{provider}/*`
//!
//! One-shot counterparts of the stream kinds, plus the two state-changing
//! operations. Each request resolves the caller's credential, builds an
//! adapter, makes one provider call under the call policy, and drops both.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Extension, Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cloudlens_core::credential::ProviderKind;
use cloudlens_core::identity::Principal;
use cloudlens_core::provider::{
    CostPeriod, Datapoint, Granularity, MetricQuery, Mutation, MutationOutcome, ResourceRef,
    TimeRange, invoke,
};

use super::{adapter_for, parse_provider};
use crate::error::AppError;
use crate::state::AppState;

const METRICS_LOOKBACK_HOURS: i64 = 1;
const STORAGE_LOOKBACK_DAYS: i64 = 1;
const BILLING_LOOKBACK_DAYS: i64 = 30;

/// Read-class routes.
pub fn read_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/{provider}/metrics", post(compute_metrics))
        .route("/v1/{provider}/storage-metrics", post(storage_metrics))
        .route("/v1/{provider}/billing", post(billing))
}

/// Mutation-class routes.
pub fn write_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/{provider}/scale", post(scale))
        .route("/v1/{provider}/firewall", post(firewall))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MetricRequest {
    #[serde(alias = "instance_id", alias = "bucket", alias = "vm_name", alias = "storage_account")]
    pub resource_id: String,
    pub resource_group: Option<String>,
    pub metric: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MetricResponse {
    pub provider: ProviderKind,
    pub resource_id: String,
    pub datapoints: Vec<Datapoint>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BillingRequest {
    pub start: Option<String>,
    pub end: Option<String>,
    pub granularity: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BillingResponse {
    pub provider: ProviderKind,
    pub granularity: Granularity,
    pub periods: Vec<CostPeriod>,
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    #[serde(alias = "asg", alias = "asg_name", alias = "scale_set")]
    pub group: String,
    pub desired_capacity: u32,
}

#[derive(Debug, Deserialize)]
pub struct FirewallRequest {
    #[serde(alias = "sg_id", alias = "nsg")]
    pub group_id: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub cidr: String,
}

fn default_protocol() -> String {
    "tcp".to_owned()
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub provider: ProviderKind,
    pub operation: &'static str,
    #[serde(flatten)]
    pub outcome: MutationOutcome,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn compute_metrics(
    state: State<Arc<AppState>>,
    principal: Extension<Principal>,
    provider: Path<String>,
    Json(body): Json<MetricRequest>,
) -> Result<Json<MetricResponse>, AppError> {
    let lookback = Duration::hours(METRICS_LOOKBACK_HOURS);
    fetch_metrics(state, principal, provider, MetricQuery::compute(), lookback, body).await
}

async fn storage_metrics(
    state: State<Arc<AppState>>,
    principal: Extension<Principal>,
    provider: Path<String>,
    Json(body): Json<MetricRequest>,
) -> Result<Json<MetricResponse>, AppError> {
    let lookback = Duration::days(STORAGE_LOOKBACK_DAYS);
    fetch_metrics(state, principal, provider, MetricQuery::storage(), lookback, body).await
}

async fn fetch_metrics(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(provider): Path<String>,
    query: MetricQuery,
    lookback: Duration,
    body: MetricRequest,
) -> Result<Json<MetricResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    if body.resource_id.trim().is_empty() {
        return Err(AppError::BadRequest("resource_id must not be empty".to_owned()));
    }
    let range = TimeRange::parse(body.start.as_deref(), body.end.as_deref(), Utc::now(), lookback)
        .map_err(AppError::BadRequest)?;
    let query = query.with_name(body.metric);
    let resource = ResourceRef::new(body.resource_id.trim()).in_group(body.resource_group);

    let adapter = adapter_for(&state, &principal.tenant_id, provider).await?;
    let mut datapoints = invoke(&state.call_policy, "fetch_metric", || {
        adapter.fetch_metric(&resource, &query, range)
    })
    .await?;
    datapoints.sort_by_key(|p| p.timestamp);

    Ok(Json(MetricResponse {
        provider,
        resource_id: resource.id,
        datapoints,
    }))
}

async fn billing(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(provider): Path<String>,
    body: Option<Json<BillingRequest>>,
) -> Result<Json<BillingResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let granularity = parse_granularity(body.granularity.as_deref())?;
    let range = TimeRange::parse(
        body.start.as_deref(),
        body.end.as_deref(),
        Utc::now(),
        Duration::days(BILLING_LOOKBACK_DAYS),
    )
    .map_err(AppError::BadRequest)?;

    let adapter = adapter_for(&state, &principal.tenant_id, provider).await?;
    let mut periods = invoke(&state.call_policy, "fetch_cost", || {
        adapter.fetch_cost(range, granularity)
    })
    .await?;
    periods.sort_by_key(|p| p.period_start);

    Ok(Json(BillingResponse {
        provider,
        granularity,
        periods,
    }))
}

fn parse_granularity(raw: Option<&str>) -> Result<Granularity, AppError> {
    match raw.map(|g| g.trim().to_ascii_uppercase()).as_deref() {
        None | Some("" | "DAILY") => Ok(Granularity::Daily),
        Some("MONTHLY") => Ok(Granularity::Monthly),
        Some(other) => Err(AppError::BadRequest(format!(
            "granularity must be DAILY or MONTHLY, got '{other}'"
        ))),
    }
}

async fn scale(
    state: State<Arc<AppState>>,
    principal: Extension<Principal>,
    provider: Path<String>,
    Json(body): Json<ScaleRequest>,
) -> Result<Json<MutationResponse>, AppError> {
    let mutation = Mutation::Scale {
        group: body.group.trim().to_owned(),
        desired_capacity: body.desired_capacity,
    };
    apply(state, principal, provider, mutation).await
}

async fn firewall(
    state: State<Arc<AppState>>,
    principal: Extension<Principal>,
    provider: Path<String>,
    Json(body): Json<FirewallRequest>,
) -> Result<Json<MutationResponse>, AppError> {
    let mutation = Mutation::FirewallRule {
        group_id: body.group_id.trim().to_owned(),
        port: body.port,
        protocol: body.protocol.trim().to_ascii_lowercase(),
        cidr: body.cidr.trim().to_owned(),
    };
    apply(state, principal, provider, mutation).await
}

async fn apply(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(provider): Path<String>,
    mutation: Mutation,
) -> Result<Json<MutationResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    let missing_role = state
        .mutation_role
        .as_deref()
        .filter(|role| !principal.has_role(role));
    if let Some(role) = missing_role {
        warn!(tenant_id = %principal.tenant_id, operation = mutation.name(), "mutation denied, missing role");
        return Err(AppError::Forbidden(format!("'{role}' role required")));
    }
    mutation.validate().map_err(AppError::BadRequest)?;

    let adapter = adapter_for(&state, &principal.tenant_id, provider).await?;
    let outcome = invoke(&state.call_policy, "apply_mutation", || {
        adapter.apply_mutation(&mutation)
    })
    .await?;
    info!(
        tenant_id = %principal.tenant_id,
        provider = provider.as_str(),
        operation = mutation.name(),
        "mutation applied"
    );

    Ok(Json(MutationResponse {
        provider,
        operation: mutation.name(),
        outcome,
    }))
}
