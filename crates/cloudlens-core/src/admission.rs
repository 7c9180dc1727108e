//! Per-identity admission control using the token bucket algorithm.
//!
//! Each `(endpoint class, identity)` pair owns one bucket. Buckets are held
//! in a sharded map; a check locks only its own shard entry, so callers with
//! different identities never contend. Idle buckets that have refilled to
//! capacity carry no state worth keeping and are dropped by [`AdmissionControl::sweep`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AdmissionError;

/// Longest `Retry-After` ever reported.
const MAX_RETRY_AFTER_SECS: u64 = 3600;

/// Budget classes. Each has its own bucket per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Read-only REST calls.
    Rest,
    /// Calls that change cloud resources or stored credentials.
    Mutation,
    /// Opening a stream session.
    StreamOpen,
}

impl EndpointClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Mutation => "mutation",
            Self::StreamOpen => "stream_open",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size and refill rate of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Burst size.
    pub capacity: u32,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

impl BucketConfig {
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
        }
    }

    /// Parse `"capacity,refill_per_sec"`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if either part is missing or
    /// not a non-negative number.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (capacity, refill) = raw
            .split_once(',')
            .ok_or_else(|| format!("expected 'capacity,refill_per_sec', got '{raw}'"))?;
        let capacity: u32 = capacity
            .trim()
            .parse()
            .map_err(|e| format!("invalid capacity '{capacity}': {e}"))?;
        let refill: f64 = refill
            .trim()
            .parse()
            .map_err(|e| format!("invalid refill rate '{refill}': {e}"))?;
        if !refill.is_finite() || refill < 0.0 {
            return Err(format!("refill rate must be a non-negative number, got {refill}"));
        }
        Ok(Self::new(capacity, refill))
    }
}

/// Budgets for every endpoint class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionConfig {
    pub rest: BucketConfig,
    pub mutation: BucketConfig,
    pub stream_open: BucketConfig,
}

impl AdmissionConfig {
    #[must_use]
    pub fn bucket(&self, class: EndpointClass) -> BucketConfig {
        match class {
            EndpointClass::Rest => self.rest,
            EndpointClass::Mutation => self.mutation,
            EndpointClass::StreamOpen => self.stream_open,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rest: BucketConfig::new(120, 2.0),
            mutation: BucketConfig::new(10, 0.2),
            stream_open: BucketConfig::new(10, 0.1),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    config: BucketConfig,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            tokens: f64::from(config.capacity),
            config,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * self.config.refill_per_sec).min(f64::from(self.config.capacity));
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn retry_after_secs(&self) -> u64 {
        if self.config.refill_per_sec <= 0.0 || self.config.capacity == 0 {
            return MAX_RETRY_AFTER_SECS;
        }
        let needed = (1.0 - self.tokens).max(0.0);
        let secs = (needed / self.config.refill_per_sec).ceil();
        (secs as u64).clamp(1, MAX_RETRY_AFTER_SECS)
    }

    fn is_full(&self) -> bool {
        self.tokens >= f64::from(self.config.capacity)
    }
}

/// Token-bucket admission control keyed by endpoint class and identity.
pub struct AdmissionControl {
    buckets: DashMap<(EndpointClass, String), TokenBucket>,
    config: AdmissionConfig,
}

impl fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("config", &self.config)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl AdmissionControl {
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        info!(
            rest_capacity = config.rest.capacity,
            mutation_capacity = config.mutation.capacity,
            stream_capacity = config.stream_open.capacity,
            "admission control initialized"
        );
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Take one token from the caller's bucket for `class`.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::RateLimited`] with a retry hint when the
    /// bucket is empty.
    pub fn check(&self, class: EndpointClass, identity: &str) -> Result<(), AdmissionError> {
        let config = self.config.bucket(class);
        let mut bucket = self
            .buckets
            .entry((class, identity.to_owned()))
            .or_insert_with(|| TokenBucket::new(config));

        if bucket.try_consume() {
            debug!(class = class.as_str(), identity, "request admitted");
            Ok(())
        } else {
            let retry_after_secs = bucket.retry_after_secs();
            warn!(class = class.as_str(), identity, retry_after_secs, "rate limit exceeded");
            Err(AdmissionError::RateLimited {
                class: class.as_str(),
                retry_after_secs,
            })
        }
    }

    /// Drop buckets that have refilled to capacity.
    pub fn sweep(&self) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refill();
            !bucket.is_full()
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Number of live buckets.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// Run [`Self::sweep`] every `every` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = control.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = control.tracked(), "swept idle rate limit buckets");
                        }
                    }
                }
            }
        })
    }
}
