//! Outbound stream messages.
//!
//! Every message is a JSON object whose `type` field echoes the stream kind
//! the client asked for. The remaining fields depend on what happened:
//!
//! | situation            | fields                                     |
//! |----------------------|--------------------------------------------|
//! | metric sample        | `instance_id`, `timestamp`, `value`, `unit` |
//! | no samples in window | `instance_id`, `message`                   |
//! | cost breakdown       | `data` (list of periods)                   |
//! | any failure          | `error`                                    |

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::provider::{CostPeriod, Datapoint};

/// Message sent in place of a sample when the window holds no data.
pub const NO_DATAPOINTS: &str = "no datapoints yet";

/// The server is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// The request violated server policy (auth, quota, bad parameters).
pub const CLOSE_POLICY: u16 = 1008;
/// The server hit an internal failure.
pub const CLOSE_INTERNAL: u16 = 1011;

/// What the client asked to stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StreamKind {
    #[default]
    Metrics,
    Billing,
    StorageMetrics,
    /// Anything else, echoed back verbatim in error envelopes.
    Unknown(String),
}

impl StreamKind {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "metrics" => Self::Metrics,
            "billing" => Self::Billing,
            "storage-metrics" | "storage_metrics" => Self::StorageMetrics,
            other => Self::Unknown(other.to_owned()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Metrics => "metrics",
            Self::Billing => "billing",
            Self::StorageMetrics => "storage-metrics",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StreamKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Payload of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EnvelopeBody {
    Sample {
        instance_id: String,
        timestamp: DateTime<Utc>,
        value: f64,
        unit: String,
    },
    Empty {
        instance_id: String,
        message: String,
    },
    Billing {
        data: Vec<CostPeriod>,
    },
    Error {
        error: String,
    },
}

/// One outbound stream message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: StreamKind,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

impl Envelope {
    #[must_use]
    pub fn sample(kind: StreamKind, instance_id: impl Into<String>, point: &Datapoint) -> Self {
        Self {
            kind,
            body: EnvelopeBody::Sample {
                instance_id: instance_id.into(),
                timestamp: point.timestamp,
                value: point.value,
                unit: point.unit.clone(),
            },
        }
    }

    #[must_use]
    pub fn no_data(kind: StreamKind, instance_id: impl Into<String>) -> Self {
        Self {
            kind,
            body: EnvelopeBody::Empty {
                instance_id: instance_id.into(),
                message: NO_DATAPOINTS.to_owned(),
            },
        }
    }

    #[must_use]
    pub fn billing(kind: StreamKind, data: Vec<CostPeriod>) -> Self {
        Self {
            kind,
            body: EnvelopeBody::Billing { data },
        }
    }

    #[must_use]
    pub fn error(kind: StreamKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            body: EnvelopeBody::Error {
                error: error.into(),
            },
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.body, EnvelopeBody::Error { .. })
    }

    /// Render as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error only if a value cannot be represented in JSON, such
    /// as a non-finite float.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A close handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_metrics_envelope_shape() {
        let env = Envelope::no_data(StreamKind::Metrics, "i-0abc");
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "metrics", "instance_id": "i-0abc", "message": "no datapoints yet"})
        );
    }

    #[test]
    fn sample_envelope_shape() {
        let point = Datapoint {
            timestamp: Utc.with_ymd_and_hms(2025, 9, 14, 10, 5, 0).unwrap(),
            value: 12.5,
            unit: "Percent".into(),
        };
        let env = Envelope::sample(StreamKind::Metrics, "i-0abc", &point);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "metrics");
        assert_eq!(value["instance_id"], "i-0abc");
        assert_eq!(value["value"], 12.5);
        assert_eq!(value["unit"], "Percent");
        assert_eq!(value["timestamp"], "2025-09-14T10:05:00Z");
    }

    #[test]
    fn billing_envelope_lists_periods() {
        let period = CostPeriod {
            period_start: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2025, 9, 2).unwrap(),
            amount: 3.25,
            currency: "USD".into(),
        };
        let value = serde_json::to_value(Envelope::billing(StreamKind::Billing, vec![period])).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "billing",
                "data": [{"period_start": "2025-09-01", "period_end": "2025-09-02", "amount": 3.25, "currency": "USD"}]
            })
        );
    }

    #[test]
    fn unknown_kind_is_echoed_in_errors() {
        let kind = StreamKind::parse("cpu");
        let value = serde_json::to_value(Envelope::error(kind, "Unknown stream type: cpu")).unwrap();
        assert_eq!(value, json!({"type": "cpu", "error": "Unknown stream type: cpu"}));
    }

    #[test]
    fn stream_kind_aliases() {
        assert_eq!(StreamKind::parse("storage_metrics"), StreamKind::StorageMetrics);
        assert_eq!(StreamKind::parse("billing"), StreamKind::Billing);
        assert_eq!(StreamKind::StorageMetrics.as_str(), "storage-metrics");
    }
}
