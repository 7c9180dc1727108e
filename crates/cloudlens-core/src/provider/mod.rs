//! Cloud provider abstraction layer.
//!
//! Each provider implements [`ProviderAdapter`] over its native APIs and
//! normalizes the results into [`Datapoint`], [`CostPeriod`] and
//! [`MutationOutcome`]. Adapters are built per call from a decrypted
//! [`Credential`] through an [`AdapterFactory`] and dropped when the call
//! ends, so plaintext secrets live no longer than one provider round trip.
//!
//! Every call site goes through [`invoke`], which applies the per-call
//! timeout and the single retry on transient failure.

mod invoke;

pub use invoke::{CallPolicy, invoke};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::credential::{Credential, Identity, ProviderKind};
use crate::error::ProviderError;

/// Which family of metric a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFamily {
    /// Instance or VM utilization.
    Compute,
    /// Bucket or storage-account capacity.
    Storage,
}

/// A metric to fetch. `name` overrides the provider's default for `family`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricQuery {
    pub family: MetricFamily,
    pub name: Option<String>,
}

impl MetricQuery {
    #[must_use]
    pub fn compute() -> Self {
        Self {
            family: MetricFamily::Compute,
            name: None,
        }
    }

    #[must_use]
    pub fn storage() -> Self {
        Self {
            family: MetricFamily::Storage,
            name: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name.filter(|n| !n.trim().is_empty());
        self
    }
}

/// The resource a metric query is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// Instance id, VM name, bucket or storage account.
    pub id: String,
    /// Azure resource group. Ignored by AWS.
    pub group: Option<String>,
}

impl ResourceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: None,
        }
    }

    #[must_use]
    pub fn in_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }
}

/// A closed time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// The window ending at `end` and reaching back `lookback`.
    #[must_use]
    pub fn ending_at(end: DateTime<Utc>, lookback: Duration) -> Self {
        Self {
            start: end - lookback,
            end,
        }
    }

    /// Parse explicit bounds, falling back to `lookback` before `now` for
    /// whichever bound is missing.
    ///
    /// Each bound may be RFC 3339 or a bare `YYYY-MM-DD` date (midnight UTC).
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if a bound does not parse or
    /// the start is after the end.
    pub fn parse(
        start: Option<&str>,
        end: Option<&str>,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Self, String> {
        let end = match end {
            Some(raw) => parse_instant(raw)?,
            None => now,
        };
        let start = match start {
            Some(raw) => parse_instant(raw)?,
            None => end - lookback,
        };
        if start > end {
            return Err(format!("start {start} is after end {end}"));
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn start_date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    #[must_use]
    pub fn end_date(&self) -> NaiveDate {
        self.end.date_naive()
    }
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)))
        .map_err(|_| format!("'{raw}' is neither RFC 3339 nor YYYY-MM-DD"))
}

/// Cost aggregation bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    #[default]
    Daily,
    Monthly,
}

/// One metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
}

/// Spend over one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostPeriod {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount: f64,
    pub currency: String,
}

/// A state-changing request against a tenant's cloud account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Set the desired capacity of a scaling group.
    Scale { group: String, desired_capacity: u32 },
    /// Open an inbound port on a security group.
    FirewallRule {
        group_id: String,
        port: u16,
        protocol: String,
        cidr: String,
    },
}

impl Mutation {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scale { .. } => "scale",
            Self::FirewallRule { .. } => "firewall_rule",
        }
    }

    /// Reject obviously malformed requests before they reach a provider.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Scale { group, .. } => {
                if group.trim().is_empty() {
                    return Err("group must not be empty".to_owned());
                }
            }
            Self::FirewallRule {
                group_id,
                port,
                protocol,
                cidr,
            } => {
                if group_id.trim().is_empty() {
                    return Err("group_id must not be empty".to_owned());
                }
                if *port == 0 {
                    return Err("port must be between 1 and 65535".to_owned());
                }
                if !matches!(protocol.as_str(), "tcp" | "udp") {
                    return Err(format!("unsupported protocol '{protocol}'"));
                }
                validate_cidr(cidr)?;
            }
        }
        Ok(())
    }
}

fn validate_cidr(cidr: &str) -> Result<(), String> {
    let invalid = || format!("'{cidr}' is not an IPv4 CIDR block");
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    addr.parse::<std::net::Ipv4Addr>().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    Ok(())
}

/// Result of an applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationOutcome {
    /// Short status, e.g. `accepted`.
    pub status: String,
    /// Provider-specific detail.
    pub detail: serde_json::Value,
}

/// A provider's native APIs, bound to one credential.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this adapter speaks to.
    fn kind(&self) -> ProviderKind;

    /// Confirm the credential works and report the account it belongs to.
    async fn validate_credential(&self) -> Result<Identity, ProviderError>;

    /// Samples for one metric of one resource over `range`, in any order.
    async fn fetch_metric(
        &self,
        resource: &ResourceRef,
        query: &MetricQuery,
        range: TimeRange,
    ) -> Result<Vec<Datapoint>, ProviderError>;

    /// Spend over `range` bucketed by `granularity`.
    async fn fetch_cost(
        &self,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<CostPeriod>, ProviderError>;

    /// Apply a state change.
    async fn apply_mutation(&self, mutation: &Mutation) -> Result<MutationOutcome, ProviderError> {
        Err(ProviderError::unsupported(
            self.kind().as_str(),
            mutation.name(),
        ))
    }
}

/// Builds adapters from decrypted credentials.
pub trait AdapterFactory: Send + Sync {
    /// Build an adapter for `credential.provider()`.
    ///
    /// # Errors
    ///
    /// Returns a permanent [`ProviderError`] if the provider is not compiled
    /// in or the credential lacks a field the adapter needs.
    fn build(&self, credential: &Credential) -> Result<Arc<dyn ProviderAdapter>, ProviderError>;
}
