//! Session lifecycle and polling loop.
//!
//! [`SessionManager::run`] drives one session from the accepted transport
//! to its close frame. The session authenticates the caller, passes stream
//! admission, resolves the tenant's credential, and then polls the provider
//! on a fixed schedule until the client leaves, a fatal error occurs, or the
//! host shuts down.
//!
//! Ordering: a session runs at most one poll at a time and sends its
//! envelope before the next poll starts, so envelopes leave in poll order.
//! While a poll is in flight the session keeps reading the transport; a
//! disconnect or shutdown drops the poll future, cancelling the provider
//! call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionControl, EndpointClass};
use crate::credential::ProviderKind;
use crate::envelope::{CloseFrame, Envelope, StreamKind};
use crate::error::{AdmissionError, VaultError};
use crate::identity::IdentityVerifier;
use crate::provider::{
    AdapterFactory, CallPolicy, Granularity, MetricQuery, ProviderAdapter, ResourceRef, TimeRange,
    invoke,
};
use crate::vault::CredentialVault;

use super::normalize::{self, Lookbacks};
use super::params::{ClientFrame, IntervalBounds, SessionParams, StreamRequest};
use super::state::{CloseReason, SessionState};
use super::transport::{Inbound, Outbox, Transport};

/// Reconfiguration frames held while a poll is in flight. Older ones are
/// dropped first.
pub(super) const MAX_DEFERRED_FRAMES: usize = 8;

/// Tunables shared by every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub interval: IntervalBounds,
    pub call_policy: CallPolicy,
    /// Upper bound on one credential lookup and decrypt.
    pub resolve_timeout: Duration,
    /// Upper bound on sending the final envelope and close frame.
    pub close_grace: Duration,
    /// Keep one adapter for the session instead of re-resolving per poll.
    pub pin_credentials: bool,
    pub lookbacks: Lookbacks,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interval: IntervalBounds::default(),
            call_policy: CallPolicy::default(),
            resolve_timeout: Duration::from_secs(2),
            close_grace: Duration::from_secs(1),
            pin_credentials: false,
            lookbacks: Lookbacks::default(),
        }
    }
}

/// Registry entry for a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    pub provider: String,
    pub kind: String,
    pub interval: Duration,
    pub resource_id: Option<String>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    /// When the last non-error poll envelope reached the client.
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub polls: u64,
    pub envelopes: u64,
    pub errors: u64,
}

/// Summary returned when a session ends.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    pub reason: CloseReason,
    pub stats: SessionStats,
    pub duration: Duration,
}

/// Removes the registry entry when the session ends, however it ends.
struct Registration<'a> {
    registry: &'a DashMap<Uuid, SessionInfo>,
    id: Uuid,
}

impl<'a> Registration<'a> {
    fn new(registry: &'a DashMap<Uuid, SessionInfo>, info: SessionInfo) -> Self {
        let id = info.id;
        registry.insert(id, info);
        Self { registry, id }
    }

    fn update(&self, f: impl FnOnce(&mut SessionInfo)) {
        if let Some(mut entry) = self.registry.get_mut(&self.id) {
            f(entry.value_mut());
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

struct Session<'a> {
    id: Uuid,
    registration: Registration<'a>,
    state: SessionState,
    tenant_id: Option<String>,
    request: StreamRequest,
    stats: SessionStats,
}

impl Session<'_> {
    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!(session_id = %self.id, from = %self.state, to = %next, "ignoring illegal session transition");
            return;
        }
        debug!(session_id = %self.id, from = %self.state, to = %next, "session transition");
        self.state = next;
        self.registration.update(|info| info.state = next);
    }
}

/// What the session holds once it is streaming.
struct Opened {
    tenant_id: String,
    provider: ProviderKind,
    pinned: Option<Arc<dyn ProviderAdapter>>,
}

/// Owns the dependencies every session needs and tracks live sessions.
pub struct SessionManager {
    verifier: Arc<dyn IdentityVerifier>,
    vault: Arc<CredentialVault>,
    adapters: Arc<dyn AdapterFactory>,
    admission: Arc<AdmissionControl>,
    config: SessionConfig,
    shutdown: CancellationToken,
    active: DashMap<Uuid, SessionInfo>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        vault: Arc<CredentialVault>,
        adapters: Arc<dyn AdapterFactory>,
        admission: Arc<AdmissionControl>,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            verifier,
            vault,
            adapters,
            admission,
            config,
            shutdown,
            active: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Parse opening parameters with this manager's interval bounds.
    #[must_use]
    pub fn params(&self, query: &HashMap<String, String>) -> SessionParams {
        SessionParams::from_query(query, &self.config.interval)
    }

    /// Snapshot of live sessions.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Ask every session to close with "going away".
    pub fn shutdown(&self) {
        info!(active = self.active.len(), "closing all stream sessions");
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until no sessions remain or `limit` elapses. Returns whether
    /// every session finished.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !self.active.is_empty() {
            if Instant::now() >= deadline {
                warn!(remaining = self.active.len(), "sessions still open after drain deadline");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Drive one session to completion over `transport`.
    ///
    /// Returns once the session is closed and deregistered. The transport is
    /// dropped before this returns.
    pub async fn run<T: Transport>(&self, transport: T, params: SessionParams) -> SessionReport {
        let id = Uuid::new_v4();
        let started = Instant::now();
        let SessionParams {
            token,
            provider,
            request,
            interval,
        } = params;

        let registration = Registration::new(
            &self.active,
            SessionInfo {
                id,
                tenant_id: None,
                provider: provider.clone(),
                kind: request.kind.as_str().to_owned(),
                interval,
                resource_id: request.resource_id.clone(),
                state: SessionState::Connecting,
                started_at: Utc::now(),
                last_success_at: None,
            },
        );
        let mut session = Session {
            id,
            registration,
            state: SessionState::Connecting,
            tenant_id: None,
            request,
            stats: SessionStats::default(),
        };
        let mut outbox = Outbox::new(transport);
        info!(session_id = %id, provider = %provider, kind = %session.request.kind, interval_secs = interval.as_secs(), "stream session opened");

        let opened = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(CloseReason::Shutdown),
            result = self.open(&mut session, token.as_deref(), &provider) => result,
        };
        let reason = match opened {
            Ok(opened) => self.stream(&mut outbox, &mut session, &opened, interval).await,
            Err(reason) => reason,
        };

        session.transition(SessionState::Closing);
        self.finish(&mut outbox, &session.request.kind, &reason).await;
        session.transition(SessionState::Closed);
        drop(outbox);

        let duration = started.elapsed();
        match reason.close_code() {
            Some(code) if code != crate::envelope::CLOSE_GOING_AWAY => warn!(
                session_id = %id,
                tenant_id = session.tenant_id.as_deref().unwrap_or("-"),
                reason = %reason,
                code,
                polls = session.stats.polls,
                "stream session closed"
            ),
            _ => info!(
                session_id = %id,
                tenant_id = session.tenant_id.as_deref().unwrap_or("-"),
                reason = reason.label(),
                polls = session.stats.polls,
                envelopes = session.stats.envelopes,
                errors = session.stats.errors,
                duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                "stream session closed"
            ),
        }

        SessionReport {
            id,
            tenant_id: session.tenant_id.clone(),
            reason,
            stats: session.stats,
            duration,
        }
    }

    async fn open(
        &self,
        session: &mut Session<'_>,
        token: Option<&str>,
        provider: &str,
    ) -> Result<Opened, CloseReason> {
        session.transition(SessionState::Authenticating);
        let token = token.ok_or_else(|| CloseReason::Unauthorized("missing token".to_owned()))?;
        let principal = self
            .verifier
            .verify(token)
            .await
            .map_err(|e| CloseReason::Unauthorized(e.to_string()))?;
        let tenant_id = principal.tenant_id;
        session.tenant_id = Some(tenant_id.clone());
        session
            .registration
            .update(|info| info.tenant_id = Some(tenant_id.clone()));

        self.admission
            .check(EndpointClass::StreamOpen, &tenant_id)
            .map_err(|AdmissionError::RateLimited { retry_after_secs, .. }| {
                CloseReason::RateLimited { retry_after_secs }
            })?;

        let provider: ProviderKind = provider
            .parse()
            .map_err(|_| CloseReason::InvalidRequest(format!("Unknown provider: {provider}")))?;

        session.transition(SessionState::ResolvingCredential);
        let adapter = self.resolve_adapter(&tenant_id, provider).await?;
        let pinned = if self.config.pin_credentials {
            info!(session_id = %session.id, tenant_id = %tenant_id, provider = provider.as_str(), "credential pinned for session lifetime");
            Some(adapter)
        } else {
            drop(adapter);
            None
        };

        session.transition(SessionState::Streaming);
        Ok(Opened {
            tenant_id,
            provider,
            pinned,
        })
    }

    /// Decrypt the tenant's credential and bind an adapter to it. The
    /// plaintext credential is dropped before this returns.
    async fn resolve_adapter(
        &self,
        tenant_id: &str,
        provider: ProviderKind,
    ) -> Result<Arc<dyn ProviderAdapter>, CloseReason> {
        let lookup = tokio::time::timeout(
            self.config.resolve_timeout,
            self.vault.get(tenant_id, provider),
        )
        .await;
        let credential = match lookup {
            Ok(Ok(credential)) => credential,
            Ok(Err(VaultError::NotFound { .. })) => {
                return Err(CloseReason::NotConfigured(format!(
                    "No {} connector found for this account",
                    provider.display_name()
                )));
            }
            Ok(Err(VaultError::Crypto(e))) => {
                error!(tenant_id, provider = provider.as_str(), error = %e, "credential decryption failed");
                return Err(CloseReason::CredentialFailure(e.to_string()));
            }
            Ok(Err(e)) => {
                error!(tenant_id, provider = provider.as_str(), error = %e, "credential lookup failed");
                return Err(CloseReason::Internal(e.to_string()));
            }
            Err(_) => {
                error!(tenant_id, provider = provider.as_str(), "credential lookup timed out");
                return Err(CloseReason::Internal("credential lookup timed out".to_owned()));
            }
        };

        self.adapters.build(&credential).map_err(|e| {
            error!(tenant_id, provider = provider.as_str(), error = %e, "adapter construction failed");
            CloseReason::CredentialFailure(e.to_string())
        })
    }

    async fn stream<T: Transport>(
        &self,
        outbox: &mut Outbox<T>,
        session: &mut Session<'_>,
        opened: &Opened,
        interval: Duration,
    ) -> CloseReason {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return CloseReason::Shutdown,
                inbound = outbox.recv() => {
                    if let Some(reason) = self.on_inbound(outbox, session, opened, inbound).await {
                        return reason;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(reason) = self.tick(outbox, session, opened).await {
                        return reason;
                    }
                }
            }
        }
    }

    /// One scheduled poll. Reconfigurations arriving mid-poll are applied
    /// after the poll's envelope is sent.
    async fn tick<T: Transport>(
        &self,
        outbox: &mut Outbox<T>,
        session: &mut Session<'_>,
        opened: &Opened,
    ) -> Option<CloseReason> {
        session.stats.polls += 1;
        let request = session.request.clone();
        let mut deferred = VecDeque::new();

        let outcome = {
            let poll = self.poll(opened, &request);
            tokio::pin!(poll);
            loop {
                tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => break Err(CloseReason::Shutdown),
                    inbound = outbox.recv() => match inbound {
                        Inbound::Closed => {
                            debug!(session_id = %session.id, "client left mid-poll, cancelling provider call");
                            break Err(CloseReason::ClientDisconnected);
                        }
                        Inbound::Text(text) => match ClientFrame::parse(&text) {
                            ClientFrame::Keepalive => {}
                            frame => {
                                if deferred.len() == MAX_DEFERRED_FRAMES {
                                    deferred.pop_front();
                                    debug!(session_id = %session.id, "dropping oldest deferred reconfiguration");
                                }
                                deferred.push_back(frame);
                            }
                        },
                        Inbound::Keepalive => {}
                    },
                    result = &mut poll => break result,
                }
            }
        };

        let envelope = match outcome {
            Ok(envelope) => envelope,
            Err(reason) => return Some(reason),
        };
        if let Some(reason) = self.deliver(outbox, session, &envelope).await {
            return Some(reason);
        }
        if !envelope.is_error() {
            let now = Utc::now();
            session.registration.update(|info| info.last_success_at = Some(now));
        }
        for frame in deferred {
            if let Some(reason) = self.on_frame(outbox, session, opened, frame).await {
                return Some(reason);
            }
        }
        None
    }

    async fn poll(&self, opened: &Opened, request: &StreamRequest) -> Result<Envelope, CloseReason> {
        let kind = request.kind.clone();
        let query = match &kind {
            StreamKind::Metrics => Some(MetricQuery::compute()),
            StreamKind::StorageMetrics => Some(MetricQuery::storage()),
            StreamKind::Billing => None,
            StreamKind::Unknown(raw) => {
                return Ok(Envelope::error(kind.clone(), format!("Unknown stream type: {raw}")));
            }
        };

        let range = match TimeRange::parse(
            request.start.as_deref(),
            request.end.as_deref(),
            Utc::now(),
            self.config.lookbacks.for_kind(&kind),
        ) {
            Ok(range) => range,
            Err(e) => return Ok(Envelope::error(kind, e)),
        };

        let resource_id = match (&query, &request.resource_id) {
            (Some(_), None) => {
                return Ok(Envelope::error(
                    kind,
                    format!("instance_id query param required for {} stream", request.kind),
                ));
            }
            (_, id) => id.clone(),
        };

        let adapter = match &opened.pinned {
            Some(adapter) => Arc::clone(adapter),
            None => self.resolve_adapter(&opened.tenant_id, opened.provider).await?,
        };
        let policy = &self.config.call_policy;

        let envelope = match (query, resource_id) {
            (Some(query), Some(resource_id)) => {
                let query = query.with_name(request.metric.clone());
                let resource = ResourceRef::new(resource_id.clone()).in_group(request.resource_group.clone());
                match invoke(policy, "fetch_metric", || adapter.fetch_metric(&resource, &query, range)).await {
                    Ok(points) => normalize::latest_sample(kind, resource_id, points),
                    Err(e) => self.provider_failure(opened, kind, &e),
                }
            }
            _ => match invoke(policy, "fetch_cost", || adapter.fetch_cost(range, Granularity::Daily)).await {
                Ok(periods) => normalize::cost_breakdown(kind, periods),
                Err(e) => self.provider_failure(opened, kind, &e),
            },
        };
        Ok(envelope)
    }

    fn provider_failure(
        &self,
        opened: &Opened,
        kind: StreamKind,
        err: &crate::error::ProviderError,
    ) -> Envelope {
        warn!(
            tenant_id = %opened.tenant_id,
            provider = opened.provider.as_str(),
            kind = %kind,
            code = %err.code,
            transient = err.transient,
            "provider call failed"
        );
        Envelope::error(kind, err.to_string())
    }

    async fn deliver<T: Transport>(
        &self,
        outbox: &mut Outbox<T>,
        session: &mut Session<'_>,
        envelope: &Envelope,
    ) -> Option<CloseReason> {
        if let Err(e) = outbox.send(envelope).await {
            return Some(CloseReason::TransportFailed(e.to_string()));
        }
        session.stats.envelopes += 1;
        if envelope.is_error() {
            session.stats.errors += 1;
        }
        None
    }

    async fn on_inbound<T: Transport>(
        &self,
        outbox: &mut Outbox<T>,
        session: &mut Session<'_>,
        opened: &Opened,
        inbound: Inbound,
    ) -> Option<CloseReason> {
        match inbound {
            Inbound::Closed => Some(CloseReason::ClientDisconnected),
            Inbound::Keepalive => None,
            Inbound::Text(text) => self.on_frame(outbox, session, opened, ClientFrame::parse(&text)).await,
        }
    }

    async fn on_frame<T: Transport>(
        &self,
        outbox: &mut Outbox<T>,
        session: &mut Session<'_>,
        opened: &Opened,
        frame: ClientFrame,
    ) -> Option<CloseReason> {
        let rejection = match frame {
            ClientFrame::Keepalive => return None,
            ClientFrame::Reconfigure(patch) => match session.request.apply(patch, opened.provider) {
                Ok(()) => {
                    let kind = session.request.kind.as_str().to_owned();
                    let resource_id = session.request.resource_id.clone();
                    info!(session_id = %session.id, kind = %kind, "session reconfigured");
                    session.registration.update(|info| {
                        info.kind = kind;
                        info.resource_id = resource_id;
                    });
                    return None;
                }
                Err(message) => message,
            },
            ClientFrame::Invalid(message) => message,
        };
        let envelope = Envelope::error(session.request.kind.clone(), rejection);
        self.deliver(outbox, session, &envelope).await
    }

    /// Best-effort final envelope and close frame, each bounded by the grace period.
    async fn finish<T: Transport>(&self, outbox: &mut Outbox<T>, kind: &StreamKind, reason: &CloseReason) {
        let Some(code) = reason.close_code() else {
            outbox.abandon();
            return;
        };
        let grace = self.config.close_grace;
        if let Some(message) = reason.client_message() {
            let envelope = Envelope::error(kind.clone(), message);
            match tokio::time::timeout(grace, outbox.send(&envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "final envelope not delivered"),
                Err(_) => debug!("final envelope timed out"),
            }
        }
        let frame = CloseFrame::new(code, reason.label());
        match tokio::time::timeout(grace, outbox.close(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "close frame not delivered"),
            Err(_) => debug!("close frame timed out"),
        }
        outbox.abandon();
    }
}
