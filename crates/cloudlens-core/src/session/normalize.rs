//! Turning provider results into stream envelopes.

use chrono::Duration;

use crate::envelope::{Envelope, StreamKind};
use crate::provider::{CostPeriod, Datapoint};

/// How far back each stream kind looks when no explicit range is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookbacks {
    pub metrics: Duration,
    pub storage: Duration,
    pub billing: Duration,
}

impl Default for Lookbacks {
    fn default() -> Self {
        Self {
            metrics: Duration::minutes(10),
            storage: Duration::days(2),
            billing: Duration::days(7),
        }
    }
}

impl Lookbacks {
    #[must_use]
    pub fn for_kind(&self, kind: &StreamKind) -> Duration {
        match kind {
            StreamKind::StorageMetrics => self.storage,
            StreamKind::Billing => self.billing,
            StreamKind::Metrics | StreamKind::Unknown(_) => self.metrics,
        }
    }
}

/// The most recent finite sample, or a "no datapoints" envelope.
#[must_use]
pub fn latest_sample(kind: StreamKind, resource_id: String, points: Vec<Datapoint>) -> Envelope {
    let latest = points
        .into_iter()
        .filter(|p| p.value.is_finite())
        .max_by_key(|p| p.timestamp);
    match latest {
        Some(point) => Envelope::sample(kind, resource_id, &point),
        None => Envelope::no_data(kind, resource_id),
    }
}

/// Periods in chronological order, without non-finite amounts.
#[must_use]
pub fn cost_breakdown(kind: StreamKind, mut periods: Vec<CostPeriod>) -> Envelope {
    periods.retain(|p| p.amount.is_finite());
    periods.sort_by_key(|p| p.period_start);
    Envelope::billing(kind, periods)
}
