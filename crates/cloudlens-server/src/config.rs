//! Server configuration for `CloudLens`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `CLOUDLENS_*` environment variables.
//! Values that fail to parse fall back to their defaults.

use std::net::SocketAddr;
use std::time::Duration;

use cloudlens_core::admission::{AdmissionConfig, BucketConfig};
use cloudlens_core::provider::CallPolicy;
use cloudlens_core::session::{IntervalBounds, SessionConfig};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Base64 AES-256 master key. `None` starts the vault keyless.
    pub master_key: Option<String>,
    /// Bearer token verification.
    pub jwt: JwtConfig,
    /// Session tunables.
    pub session: SessionConfig,
    /// Per endpoint class token buckets.
    pub admission: AdmissionConfig,
    /// How long shutdown waits for open streams to close.
    pub drain_timeout: Duration,
    /// Role a caller needs to scale groups or open firewall ports.
    pub mutation_role: Option<String>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("storage_backend", &self.storage_backend)
            .field("log_level", &self.log_level)
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .field("jwt", &self.jwt)
            .field("session", &self.session)
            .field("admission", &self.admission)
            .field("mutation_role", &self.mutation_role)
            .finish_non_exhaustive()
    }
}

/// HS256 verification settings.
#[derive(Clone, Default)]
pub struct JwtConfig {
    /// Shared secret. When unset every token is rejected.
    pub secret: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `RocksDB` persistent storage.
    RocksDb { path: String },
    /// PostgreSQL persistent storage.
    Postgres { url: String },
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT`: port to bind on (binds to `0.0.0.0`)
    /// - `CLOUDLENS_BIND_ADDR`: full bind address (overrides `PORT`, default: `127.0.0.1:8300`)
    /// - `CLOUDLENS_STORAGE`: `memory`, `rocksdb`, or `postgres` (default: `memory`)
    /// - `CLOUDLENS_STORAGE_PATH`: path for `RocksDB` (default: `./data`)
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `CLOUDLENS_LOG_LEVEL`: log filter (default: `info`)
    /// - `CLOUDLENS_MASTER_KEY`: base64 32-byte key (unset starts keyless)
    /// - `CLOUDLENS_JWT_SECRET`, `CLOUDLENS_JWT_ISSUER`, `CLOUDLENS_JWT_AUDIENCE`
    /// - `CLOUDLENS_MIN_INTERVAL_SECS` / `CLOUDLENS_MAX_INTERVAL_SECS` (default: `1` / `3600`)
    /// - `CLOUDLENS_PROVIDER_TIMEOUT_SECS` (default: `20`)
    /// - `CLOUDLENS_DECRYPT_TIMEOUT_MS` (default: `2000`)
    /// - `CLOUDLENS_RETRY_BACKOFF_MS` (default: `500`)
    /// - `CLOUDLENS_PIN_CREDENTIALS` (default: `false`)
    /// - `CLOUDLENS_RATE_REST` / `_MUTATION` / `_STREAM`: `capacity,refill_per_sec`
    /// - `CLOUDLENS_DRAIN_TIMEOUT_SECS` (default: `10`)
    /// - `CLOUDLENS_MUTATION_ROLE`: role required for scale and firewall calls (unset allows any caller)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        // Priority: CLOUDLENS_BIND_ADDR > PORT > default 127.0.0.1:8300
        let default_addr = SocketAddr::from(([127, 0, 0, 1], 8300));
        let bind_addr = if let Some(addr) = var("CLOUDLENS_BIND_ADDR") {
            addr.parse().unwrap_or(default_addr)
        } else if let Some(port) = var("PORT") {
            SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(8300)))
        } else {
            default_addr
        };

        let storage_path = var("CLOUDLENS_STORAGE_PATH").unwrap_or_else(|| "./data".to_owned());
        let storage_backend = match var("CLOUDLENS_STORAGE")
            .unwrap_or_else(|| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "rocksdb" => StorageBackendType::RocksDb { path: storage_path },
            "postgres" | "postgresql" => StorageBackendType::Postgres {
                url: var("DATABASE_URL").unwrap_or_else(|| "postgres://localhost/cloudlens".to_owned()),
            },
            _ => StorageBackendType::Memory,
        };

        let log_level = var("CLOUDLENS_LOG_LEVEL").unwrap_or_else(|| "info".to_owned());
        let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        let jwt = JwtConfig {
            secret: non_empty("CLOUDLENS_JWT_SECRET"),
            issuer: non_empty("CLOUDLENS_JWT_ISSUER"),
            audience: non_empty("CLOUDLENS_JWT_AUDIENCE"),
        };

        let number = |name: &str, default: u64| {
            var(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let flag = |name: &str| var(name).is_some_and(|v| v == "true" || v == "1");

        let defaults = SessionConfig::default();
        let min = Duration::from_secs(number("CLOUDLENS_MIN_INTERVAL_SECS", 1).max(1));
        let max = Duration::from_secs(number("CLOUDLENS_MAX_INTERVAL_SECS", 3600)).max(min);
        let session = SessionConfig {
            interval: IntervalBounds {
                min,
                max,
                default: defaults.interval.default.clamp(min, max),
            },
            call_policy: CallPolicy {
                timeout: Duration::from_secs(number("CLOUDLENS_PROVIDER_TIMEOUT_SECS", 20).max(1)),
                retry_backoff: Duration::from_millis(number("CLOUDLENS_RETRY_BACKOFF_MS", 500)),
            },
            resolve_timeout: Duration::from_millis(number("CLOUDLENS_DECRYPT_TIMEOUT_MS", 2000).max(1)),
            pin_credentials: flag("CLOUDLENS_PIN_CREDENTIALS"),
            ..defaults
        };

        let base = AdmissionConfig::default();
        let bucket = |name: &str, fallback: BucketConfig| {
            var(name)
                .and_then(|raw| BucketConfig::parse(&raw).ok())
                .unwrap_or(fallback)
        };
        let admission = AdmissionConfig {
            rest: bucket("CLOUDLENS_RATE_REST", base.rest),
            mutation: bucket("CLOUDLENS_RATE_MUTATION", base.mutation),
            stream_open: bucket("CLOUDLENS_RATE_STREAM", base.stream_open),
        };

        Self {
            bind_addr,
            storage_backend,
            log_level,
            master_key: non_empty("CLOUDLENS_MASTER_KEY"),
            jwt,
            session,
            admission,
            drain_timeout: Duration::from_secs(number("CLOUDLENS_DRAIN_TIMEOUT_SECS", 10)),
            mutation_role: non_empty("CLOUDLENS_MUTATION_ROLE").map(|r| r.trim().to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]);
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8300)));
        assert_eq!(config.storage_backend, StorageBackendType::Memory);
        assert!(config.master_key.is_none());
        assert!(config.jwt.secret.is_none());
        assert_eq!(config.session.call_policy.timeout, Duration::from_secs(20));
        assert_eq!(config.session.resolve_timeout, Duration::from_millis(2000));
        assert!(!config.session.pin_credentials);
        assert_eq!(config.admission, AdmissionConfig::default());
        assert!(config.mutation_role.is_none());
    }

    #[test]
    fn port_binds_all_interfaces() {
        let config = load(&[("PORT", "9000")]);
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 9000)));
    }

    #[test]
    fn unparsable_values_fall_back() {
        let config = load(&[
            ("CLOUDLENS_BIND_ADDR", "not an address"),
            ("CLOUDLENS_PROVIDER_TIMEOUT_SECS", "soon"),
            ("CLOUDLENS_RATE_REST", "lots"),
        ]);
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8300)));
        assert_eq!(config.session.call_policy.timeout, Duration::from_secs(20));
        assert_eq!(config.admission.rest, AdmissionConfig::default().rest);
    }

    #[test]
    fn overrides_apply() {
        let config = load(&[
            ("CLOUDLENS_STORAGE", "postgres"),
            ("DATABASE_URL", "postgres://db/lens"),
            ("CLOUDLENS_MIN_INTERVAL_SECS", "10"),
            ("CLOUDLENS_MAX_INTERVAL_SECS", "60"),
            ("CLOUDLENS_PIN_CREDENTIALS", "true"),
            ("CLOUDLENS_RATE_STREAM", "3,0.5"),
            ("CLOUDLENS_JWT_SECRET", "s3cret"),
            ("CLOUDLENS_MUTATION_ROLE", " admin "),
        ]);
        assert_eq!(
            config.storage_backend,
            StorageBackendType::Postgres { url: "postgres://db/lens".into() }
        );
        assert_eq!(config.session.interval.min, Duration::from_secs(10));
        assert_eq!(config.session.interval.max, Duration::from_secs(60));
        assert_eq!(config.session.interval.default, Duration::from_secs(10));
        assert!(config.session.pin_credentials);
        assert_eq!(config.admission.stream_open, BucketConfig::new(3, 0.5));
        assert_eq!(config.mutation_role.as_deref(), Some("admin"));
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
