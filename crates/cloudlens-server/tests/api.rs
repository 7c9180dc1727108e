//! Router-level tests against the in-memory backend and a fake provider.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use chrono::{NaiveDate, TimeZone, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use cloudlens_core::admission::{AdmissionConfig, AdmissionControl, BucketConfig};
use cloudlens_core::credential::{Credential, Identity, ProviderKind};
use cloudlens_core::crypto::EncryptionKey;
use cloudlens_core::error::ProviderError;
use cloudlens_core::provider::{
    AdapterFactory, CostPeriod, Datapoint, Granularity, MetricQuery, Mutation, MutationOutcome,
    ProviderAdapter, ResourceRef, TimeRange,
};
use cloudlens_core::session::SessionConfig;
use cloudlens_core::vault::CredentialVault;
use cloudlens_server::auth::JwtVerifier;
use cloudlens_server::config::JwtConfig;
use cloudlens_server::routes::build_router;
use cloudlens_server::state::AppState;
use cloudlens_storage::{MemoryBackend, RecordKey, StorageBackend, StorageError};

const SECRET: &str = "api-test-secret";
const REJECTED_KEY: &str = "AKIAREJECTED";

// ── Test doubles ─────────────────────────────────────────────────────

struct FakeAdapter {
    kind: ProviderKind,
    reject: bool,
    mutations: Arc<AtomicUsize>,
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn validate_credential(&self) -> Result<Identity, ProviderError> {
        if self.reject {
            return Err(ProviderError::permanent(
                "InvalidClientTokenId",
                "The security token included in the request is invalid.",
            ));
        }
        Ok(Identity {
            account_id: "123456789012".into(),
            principal: "arn:aws:iam::123456789012:user/ops".into(),
            display_name: None,
        })
    }

    async fn fetch_metric(
        &self,
        _resource: &ResourceRef,
        _query: &MetricQuery,
        _range: TimeRange,
    ) -> Result<Vec<Datapoint>, ProviderError> {
        let at = |minute| Utc.with_ymd_and_hms(2025, 9, 14, 12, minute, 0).unwrap();
        Ok(vec![
            Datapoint {
                timestamp: at(5),
                value: 7.5,
                unit: "Percent".into(),
            },
            Datapoint {
                timestamp: at(1),
                value: 2.5,
                unit: "Percent".into(),
            },
        ])
    }

    async fn fetch_cost(
        &self,
        _range: TimeRange,
        _granularity: Granularity,
    ) -> Result<Vec<CostPeriod>, ProviderError> {
        Ok(vec![CostPeriod {
            period_start: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2025, 9, 2).unwrap(),
            amount: 12.5,
            currency: "USD".into(),
        }])
    }

    async fn apply_mutation(&self, mutation: &Mutation) -> Result<MutationOutcome, ProviderError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(MutationOutcome {
            status: "ok".into(),
            detail: json!({ "operation": mutation.name() }),
        })
    }
}

#[derive(Default)]
struct FakeFactory {
    mutations: Arc<AtomicUsize>,
}

impl AdapterFactory for FakeFactory {
    fn build(&self, credential: &Credential) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        Ok(Arc::new(FakeAdapter {
            kind: credential.provider(),
            reject: credential.field("access_key") == Some(REJECTED_KEY),
            mutations: Arc::clone(&self.mutations),
        }))
    }
}

/// Counts record reads so tests can see whether a handler touched the vault.
#[derive(Clone, Default)]
struct CountingBackend {
    inner: MemoryBackend,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl StorageBackend for CountingBackend {
    async fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<RecordKey>, StorageError> {
        self.inner.list(tenant_id).await
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct TestApp {
    router: Router,
    mutations: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

fn app_with(admission: AdmissionConfig) -> TestApp {
    build_app(admission, None)
}

fn build_app(admission: AdmissionConfig, mutation_role: Option<&str>) -> TestApp {
    let backend = CountingBackend::default();
    let reads = Arc::clone(&backend.reads);
    let vault = Arc::new(CredentialVault::new(
        Arc::new(backend),
        Some(EncryptionKey::generate()),
    ));
    let verifier = Arc::new(JwtVerifier::new(&JwtConfig {
        secret: Some(SECRET.into()),
        issuer: None,
        audience: None,
    }));
    let factory = FakeFactory::default();
    let mutations = Arc::clone(&factory.mutations);
    let state = AppState::new(
        vault,
        verifier,
        Arc::new(factory),
        Arc::new(AdmissionControl::new(admission)),
        SessionConfig::default(),
        CancellationToken::new(),
    )
    .with_mutation_role(mutation_role.map(str::to_owned));
    TestApp {
        router: build_router(Arc::new(state)),
        mutations,
        reads,
    }
}

fn app() -> TestApp {
    app_with(AdmissionConfig::default())
}

/// Tenants named `admin-*` carry the `admin` role, everyone else `viewer`.
fn token(sub: &str) -> String {
    let role = if sub.starts_with("admin-") { "admin" } else { "viewer" };
    let claims = json!({
        "sub": sub,
        "email": format!("{sub}@example.com"),
        "roles": [role],
        "exp": Utc::now().timestamp() + 3600,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

impl TestApp {
    async fn call(
        &self,
        method: Method,
        uri: &str,
        tenant: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(tenant) = tenant {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token(tenant)));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, json)
    }

    async fn connect_aws(&self, tenant: &str) -> (StatusCode, Value) {
        let (status, _, body) = self
            .call(
                Method::POST,
                "/v1/connectors/aws",
                Some(tenant),
                Some(json!({"access_key": "AKIAEXAMPLE", "secret_key": "wJalrXUtnFEMI"})),
            )
            .await;
        (status, body)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_needs_no_token() {
    let app = app();
    let (status, headers, body) = app.call(Method::GET, "/v1/sys/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["vault_key"], true);
    assert_eq!(body["active_sessions"], 0);
    assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(headers[header::CACHE_CONTROL], "no-store");
}

#[tokio::test]
async fn missing_or_bad_token_is_unauthorized() {
    let app = app();
    let (status, _, body) = app.call(Method::GET, "/v1/connectors/status", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let req = Request::builder()
        .uri("/v1/connectors/status")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn connect_status_disconnect() {
    let app = app();

    let (status, body) = app.connect_aws("tenant-a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "aws");
    assert_eq!(body["identity"]["account_id"], "123456789012");
    assert!(!body.to_string().contains("wJalrXUtnFEMI"));

    let (_, _, body) = app.call(Method::GET, "/v1/connectors/status", Some("tenant-a"), None).await;
    assert_eq!(body, json!({"aws": true, "azure": false}));

    // Another tenant sees nothing.
    let (_, _, body) = app.call(Method::GET, "/v1/connectors/status", Some("tenant-b"), None).await;
    assert_eq!(body, json!({"aws": false, "azure": false}));

    let (status, _, _) = app.call(Method::DELETE, "/v1/connectors/aws", Some("tenant-a"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = app.call(Method::DELETE, "/v1/connectors/aws", Some("tenant-a"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, _, body) = app.call(Method::GET, "/v1/connectors/status", Some("tenant-a"), None).await;
    assert_eq!(body["aws"], false);
}

#[tokio::test]
async fn rejected_credential_is_not_stored() {
    let app = app();
    let (status, _, body) = app
        .call(
            Method::POST,
            "/v1/connectors/aws",
            Some("tenant-a"),
            Some(json!({"access_key": REJECTED_KEY, "secret_key": "x"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("credential rejected"));

    let (_, _, body) = app.call(Method::GET, "/v1/connectors/status", Some("tenant-a"), None).await;
    assert_eq!(body["aws"], false);
}

#[tokio::test]
async fn connect_rejects_missing_and_unknown_fields() {
    let app = app();
    let (status, _, _) = app
        .call(
            Method::POST,
            "/v1/connectors/azure",
            Some("tenant-a"),
            Some(json!({"tenant_id": "t", "client_id": "c"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = app
        .call(
            Method::POST,
            "/v1/connectors/aws",
            Some("tenant-a"),
            Some(json!({"access_key": "a", "secret_key": "b", "password": "c"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let app = app();
    let (status, _, _) = app
        .call(Method::POST, "/v1/gcp/metrics", Some("tenant-a"), Some(json!({"resource_id": "x"})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_need_a_connector() {
    let app = app();
    let (status, _, body) = app
        .call(Method::POST, "/v1/aws/metrics", Some("tenant-a"), Some(json!({"instance_id": "i-1"})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "No AWS connector found for this account");
}

#[tokio::test]
async fn metrics_are_returned_in_order() {
    let app = app();
    app.connect_aws("tenant-a").await;
    let (status, _, body) = app
        .call(Method::POST, "/v1/aws/metrics", Some("tenant-a"), Some(json!({"instance_id": "i-1"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resource_id"], "i-1");
    let points = body["datapoints"].as_array().unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0]["value"], 2.5);
    assert_eq!(points[1]["value"], 7.5);
}

#[tokio::test]
async fn billing_defaults_and_validation() {
    let app = app();
    app.connect_aws("tenant-a").await;

    let (status, _, body) = app.call(Method::POST, "/v1/aws/billing", Some("tenant-a"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["granularity"], "DAILY");
    assert_eq!(body["periods"][0]["amount"], 12.5);
    assert_eq!(body["periods"][0]["period_start"], "2025-09-01");

    let (status, _, _) = app
        .call(
            Method::POST,
            "/v1/aws/billing",
            Some("tenant-a"),
            Some(json!({"start": "2025-09-10", "end": "2025-09-01"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_mutation_never_reaches_provider() {
    let app = app();
    app.connect_aws("tenant-a").await;
    let (status, _, _) = app
        .call(
            Method::POST,
            "/v1/aws/firewall",
            Some("tenant-a"),
            Some(json!({"sg_id": "sg-1", "port": 0, "cidr": "10.0.0.0/8"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = app
        .call(
            Method::POST,
            "/v1/aws/firewall",
            Some("tenant-a"),
            Some(json!({"sg_id": "sg-1", "port": 22, "cidr": "everywhere"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.mutations.load(Ordering::SeqCst), 0);

    let (status, _, body) = app
        .call(
            Method::POST,
            "/v1/aws/scale",
            Some("tenant-a"),
            Some(json!({"asg": "web", "desired_capacity": 3})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["operation"], "scale");
    assert_eq!(app.mutations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rate_limit_returns_retry_after() {
    let app = app_with(AdmissionConfig {
        rest: BucketConfig::new(1, 0.0),
        ..AdmissionConfig::default()
    });
    app.connect_aws("tenant-a").await;
    let metrics = || {
        app.call(
            Method::POST,
            "/v1/aws/metrics",
            Some("tenant-a"),
            Some(json!({"instance_id": "i-0abc"})),
        )
    };

    let (status, _, _) = metrics().await;
    assert_eq!(status, StatusCode::OK);
    let reads = app.reads.load(Ordering::SeqCst);
    assert!(reads > 0);

    let (status, headers, body) = metrics().await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limited");
    assert!(headers.contains_key(header::RETRY_AFTER));
    // Rejected before the credential was looked up.
    assert_eq!(app.reads.load(Ordering::SeqCst), reads);

    // Buckets are per identity.
    let (status, _, _) = app.call(Method::GET, "/v1/connectors/status", Some("tenant-b"), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn account_deletion_removes_every_connector() {
    let app = app();
    app.connect_aws("tenant-a").await;
    let (status, _) = app.connect_aws("tenant-b").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = app
        .call(
            Method::POST,
            "/v1/connectors/azure",
            Some("tenant-a"),
            Some(json!({
                "tenant_id": "t", "client_id": "c", "client_secret": "s", "subscription_id": "sub"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = app.call(Method::DELETE, "/v1/account", Some("tenant-a"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);

    let (_, _, body) = app.call(Method::GET, "/v1/connectors/status", Some("tenant-b"), None).await;
    assert_eq!(body["aws"], true);
}

#[tokio::test]
async fn profile_echoes_claims() {
    let app = app();
    let (status, _, body) = app.call(Method::GET, "/v1/profile", Some("tenant-a"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenant_id"], "tenant-a");
    assert_eq!(body["email"], "tenant-a@example.com");
    assert_eq!(body["roles"], json!(["viewer"]));
}

#[tokio::test]
async fn mutation_role_is_enforced_when_configured() {
    let app = build_app(AdmissionConfig::default(), Some("admin"));
    app.connect_aws("tenant-a").await;
    app.connect_aws("admin-a").await;
    let scale = json!({"asg": "web-asg", "desired_capacity": 2});

    let reads = app.reads.load(Ordering::SeqCst);
    let (status, _, body) = app
        .call(Method::POST, "/v1/aws/scale", Some("tenant-a"), Some(scale.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "'admin' role required");
    assert_eq!(app.reads.load(Ordering::SeqCst), reads);
    assert_eq!(app.mutations.load(Ordering::SeqCst), 0);

    let (status, _, _) = app
        .call(Method::POST, "/v1/aws/scale", Some("admin-a"), Some(scale))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.mutations.load(Ordering::SeqCst), 1);

    // Reads stay open to every role.
    let (status, _, _) = app
        .call(Method::POST, "/v1/aws/metrics", Some("tenant-a"), Some(json!({"instance_id": "i-0abc"})))
        .await;
    assert_eq!(status, StatusCode::OK);
}
