//! `CloudLens` server entry point.
//!
//! Loads configuration, opens the storage backend and credential vault,
//! then starts the Axum HTTP server with graceful shutdown. On SIGINT or
//! SIGTERM every stream session is closed with "going away" and given a
//! bounded window to finish before the process exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cloudlens_core::admission::AdmissionControl;
use cloudlens_core::crypto::EncryptionKey;
use cloudlens_core::vault::CredentialVault;
use cloudlens_storage::{MemoryBackend, StorageBackend};

use cloudlens_server::auth::JwtVerifier;
use cloudlens_server::config::{ServerConfig, StorageBackendType};
use cloudlens_server::providers::CloudAdapterFactory;
use cloudlens_server::routes;
use cloudlens_server::state::AppState;

/// How often idle rate-limit buckets are dropped.
const BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage_backend, "CloudLens starting");

    let shutdown = CancellationToken::new();
    let state = build_app_state(&config, shutdown.clone()).await?;

    let sweeper = state
        .admission
        .spawn_sweeper(BUCKET_SWEEP_INTERVAL, shutdown.clone());

    let app = routes::build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "CloudLens server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    info!(active = state.sessions.active_count(), "draining stream sessions");
    if !state.sessions.drain(config.drain_timeout).await {
        warn!("exiting with stream sessions still open");
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), sweeper).await;

    info!("CloudLens server stopped");
    Ok(())
}

/// Open storage, load the master key, and wire the subsystems together.
async fn build_app_state(
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<Arc<AppState>> {
    let storage: Arc<dyn StorageBackend> = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (credentials will not persist)");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackendType::RocksDb { path } => {
            info!(path = %path, "using RocksDB storage");
            Arc::new(
                cloudlens_storage::RocksDbBackend::open(path)
                    .context("failed to open RocksDB storage")?,
            )
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackendType::RocksDb { .. } => {
            anyhow::bail!("RocksDB backend requested but feature 'rocksdb-backend' is not enabled");
        }
        #[cfg(feature = "postgres-backend")]
        StorageBackendType::Postgres { url } => {
            info!(url = %"[redacted]", "using PostgreSQL storage");
            Arc::new(
                cloudlens_storage::PostgresBackend::connect(url)
                    .await
                    .context("failed to connect to PostgreSQL")?,
            )
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageBackendType::Postgres { .. } => {
            anyhow::bail!("PostgreSQL backend requested but feature 'postgres-backend' is not enabled");
        }
    };

    let key = match &config.master_key {
        Some(encoded) => {
            let key = EncryptionKey::from_base64(encoded)
                .context("CLOUDLENS_MASTER_KEY must be 32 bytes of base64")?;
            info!(key_id = %key.fingerprint(), "master key loaded");
            Some(key)
        }
        None => {
            warn!("CLOUDLENS_MASTER_KEY not set, connectors cannot be stored or read");
            None
        }
    };
    let vault = Arc::new(CredentialVault::new(storage, key));

    let verifier = Arc::new(JwtVerifier::new(&config.jwt));
    let adapters = Arc::new(CloudAdapterFactory::new().context("failed to build provider clients")?);
    let admission = Arc::new(AdmissionControl::new(config.admission));

    if let Some(role) = &config.mutation_role {
        info!(role = %role, "provider mutations restricted to role");
    }
    let state = AppState::new(
        vault,
        verifier,
        adapters,
        admission,
        config.session.clone(),
        shutdown,
    )
    .with_mutation_role(config.mutation_role.clone());
    Ok(Arc::new(state))
}

/// Wait for SIGINT or SIGTERM, then cancel `shutdown`.
///
/// Cancelling closes every stream session, which lets the upgraded
/// connections finish so the HTTP server can stop.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    shutdown.cancel();
}
