//! Session open parameters and inbound reconfiguration frames.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::credential::ProviderKind;
use crate::envelope::StreamKind;

/// Inbound frames longer than this are never parsed.
pub const MAX_CLIENT_FRAME: usize = 16 * 1024;

/// Query keys that all name the resource a metric stream watches.
const RESOURCE_KEYS: &[&str] = &["instance_id", "resource_id", "vm_name", "bucket", "storage_account"];

/// Allowed polling interval range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalBounds {
    pub min: Duration,
    pub max: Duration,
    pub default: Duration,
}

impl Default for IntervalBounds {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(3600),
            default: Duration::from_secs(5),
        }
    }
}

impl IntervalBounds {
    /// Interpret a requested interval in whole seconds.
    ///
    /// Missing or unparseable values take the default; anything else is
    /// clamped into `[min, max]`.
    #[must_use]
    pub fn resolve(&self, requested: Option<&str>) -> Duration {
        let requested = requested
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map_or(self.default, Duration::from_secs);
        requested.clamp(self.min, self.max.max(self.min))
    }
}

/// What a session streams and about which resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub kind: StreamKind,
    pub resource_id: Option<String>,
    pub resource_group: Option<String>,
    pub metric: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl StreamRequest {
    /// Merge a reconfiguration into this request.
    ///
    /// Fields absent from the patch keep their value; fields present but
    /// empty are cleared.
    ///
    /// # Errors
    ///
    /// Returns a message for the client if the patch tries to switch the
    /// session to another provider.
    pub fn apply(&mut self, patch: StreamPatch, provider: ProviderKind) -> Result<(), String> {
        if let Some(raw) = patch.provider.as_deref() {
            match raw.parse::<ProviderKind>() {
                Ok(p) if p == provider => {}
                _ => return Err(format!("provider cannot change mid-session (session is {provider})")),
            }
        }
        if let Some(kind) = patch.kind {
            self.kind = StreamKind::parse(&kind);
        }
        merge(&mut self.resource_id, patch.resource_id);
        merge(&mut self.resource_group, patch.resource_group);
        merge(&mut self.metric, patch.metric);
        merge(&mut self.start, patch.start);
        merge(&mut self.end, patch.end);
        Ok(())
    }
}

fn merge(slot: &mut Option<String>, update: Option<String>) {
    if let Some(value) = update {
        *slot = non_empty(value);
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Everything a session needs from its opening request.
#[derive(Clone)]
pub struct SessionParams {
    pub token: Option<String>,
    /// Raw provider name, checked after authentication.
    pub provider: String,
    pub request: StreamRequest,
    pub interval: Duration,
}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("provider", &self.provider)
            .field("request", &self.request)
            .field("interval", &self.interval)
            .finish()
    }
}

impl SessionParams {
    /// Read parameters from a parsed query string.
    ///
    /// `type` defaults to `metrics`, `provider` to `aws` and `interval` to
    /// the configured default.
    #[must_use]
    pub fn from_query(query: &HashMap<String, String>, bounds: &IntervalBounds) -> Self {
        let get = |key: &str| query.get(key).cloned().and_then(non_empty);
        let resource_id = RESOURCE_KEYS.iter().find_map(|key| get(*key));

        Self {
            token: get("token"),
            provider: get("provider").unwrap_or_else(|| ProviderKind::Aws.as_str().to_owned()),
            request: StreamRequest {
                kind: get("type").map(|k| StreamKind::parse(&k)).unwrap_or_default(),
                resource_id,
                resource_group: get("resource_group"),
                metric: get("metric"),
                start: get("start"),
                end: get("end"),
            },
            interval: bounds.resolve(query.get("interval").map(String::as_str)),
        }
    }
}

/// A partial [`StreamRequest`] sent by the client mid-session.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamPatch {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(alias = "instance_id", alias = "vm_name", alias = "bucket", alias = "storage_account")]
    pub resource_id: Option<String>,
    pub resource_group: Option<String>,
    pub metric: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub provider: Option<String>,
}

/// How an inbound text frame is interpreted.
#[derive(Debug)]
pub enum ClientFrame {
    /// Anything that is not a reconfiguration.
    Keepalive,
    /// A JSON object carrying a `type` field.
    Reconfigure(StreamPatch),
    /// Looked like a reconfiguration but could not be applied.
    Invalid(String),
}

impl ClientFrame {
    #[must_use]
    pub fn parse(text: &str) -> Self {
        if text.len() > MAX_CLIENT_FRAME {
            return Self::Keepalive;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return Self::Keepalive;
        };
        let is_reconfigure = value.as_object().is_some_and(|map| map.contains_key("type"));
        if !is_reconfigure {
            return Self::Keepalive;
        }
        match serde_json::from_value::<StreamPatch>(value) {
            Ok(patch) => Self::Reconfigure(patch),
            Err(e) => Self::Invalid(format!("invalid reconfiguration: {e}")),
        }
    }
}
