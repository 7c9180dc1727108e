//! Azure adapter over the Resource Manager REST API.
//!
//! A client-credentials token for `management.azure.com` is fetched on first
//! use and cached for the life of the adapter, which is one call. Metrics
//! come from Azure Monitor, cost from the Cost Management query API.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::debug;

use cloudlens_core::credential::{Credential, Identity, ProviderKind, SecretValue};
use cloudlens_core::error::ProviderError;
use cloudlens_core::provider::{
    CostPeriod, Datapoint, Granularity, MetricFamily, MetricQuery, Mutation, MutationOutcome,
    ProviderAdapter, ResourceRef, TimeRange,
};

use super::required;

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const MANAGEMENT_BASE: &str = "https://management.azure.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

const SUBSCRIPTION_API: &str = "2022-12-01";
const METRICS_API: &str = "2018-01-01";
const COST_API: &str = "2023-03-01";
const COMPUTE_API: &str = "2024-07-01";
const NETWORK_API: &str = "2024-05-01";

/// Cost column names Cost Management may use for the summed amount.
const COST_COLUMNS: &[&str] = &["PreTaxCost", "totalCost", "Cost"];

/// NSG rule priorities available to generated rules.
const RULE_PRIORITY_MIN: u32 = 100;
const RULE_PRIORITY_MAX: u32 = 4096;

/// Monitor coordinates for one metric family.
struct MetricTarget {
    resource_type: &'static str,
    metric: &'static str,
    interval: &'static str,
}

fn target(family: MetricFamily) -> MetricTarget {
    match family {
        MetricFamily::Compute => MetricTarget {
            resource_type: "Microsoft.Compute/virtualMachines",
            metric: "Percentage CPU",
            interval: "PT1M",
        },
        MetricFamily::Storage => MetricTarget {
            resource_type: "Microsoft.Storage/storageAccounts",
            metric: "UsedCapacity",
            interval: "PT1H",
        },
    }
}

/// An adapter bound to one tenant's service principal.
pub struct AzureAdapter {
    http: Client,
    tenant: String,
    client_id: String,
    client_secret: SecretValue,
    subscription: String,
    resource_group: Option<String>,
    token: OnceCell<SecretValue>,
}

impl std::fmt::Debug for AzureAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureAdapter")
            .field("subscription", &self.subscription)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl AzureAdapter {
    /// # Errors
    ///
    /// Returns an error if the credential lacks a service principal field.
    pub fn from_credential(http: Client, credential: &Credential) -> Result<Self, ProviderError> {
        Ok(Self {
            http,
            tenant: required(credential, "tenant_id")?.to_owned(),
            client_id: required(credential, "client_id")?.to_owned(),
            client_secret: SecretValue::new(required(credential, "client_secret")?),
            subscription: required(credential, "subscription_id")?.to_owned(),
            resource_group: credential.field("resource_group").map(str::to_owned),
            token: OnceCell::new(),
        })
    }

    async fn token(&self) -> Result<&SecretValue, ProviderError> {
        self.token.get_or_try_init(|| self.fetch_token()).await
    }

    async fn fetch_token(&self) -> Result<SecretValue, ProviderError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let url = format!("{LOGIN_BASE}/{}/oauth2/v2.0/token", self.tenant);
        let response = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose()),
                ("scope", MANAGEMENT_SCOPE),
            ])
            .send()
            .await
            .map_err(http_error)?;
        let token: TokenResponse = read_json(response).await?;
        debug!(client_id = %self.client_id, "azure access token acquired");
        Ok(SecretValue::new(token.access_token))
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        let token = self.token().await?;
        let response = request
            .bearer_auth(token.expose())
            .send()
            .await
            .map_err(http_error)?;
        read_json(response).await
    }

    fn subscription_url(&self) -> String {
        format!("{MANAGEMENT_BASE}/subscriptions/{}", self.subscription)
    }

    /// Split `rg/name` or fall back to the credential's resource group.
    fn locate<'a>(&'a self, explicit: Option<&'a str>, name: &'a str) -> Result<(&'a str, &'a str), ProviderError> {
        if let Some((group, name)) = name.split_once('/') {
            return Ok((group, name));
        }
        let group = explicit
            .or(self.resource_group.as_deref())
            .filter(|g| !g.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::permanent(
                    "MissingResourceGroup",
                    format!("no resource group given for '{name}'"),
                )
            })?;
        Ok((group, name))
    }

    fn resource_path(&self, resource: &ResourceRef, resource_type: &str) -> Result<String, ProviderError> {
        if resource.id.starts_with("/subscriptions/") {
            return Ok(resource.id.clone());
        }
        let (group, name) = self.locate(resource.group.as_deref(), &resource.id)?;
        Ok(format!(
            "/subscriptions/{}/resourceGroups/{group}/providers/{resource_type}/{name}",
            self.subscription
        ))
    }
}

#[async_trait]
impl ProviderAdapter for AzureAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    async fn validate_credential(&self) -> Result<Identity, ProviderError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Subscription {
            subscription_id: String,
            #[serde(default)]
            display_name: Option<String>,
        }

        let url = format!("{}?api-version={SUBSCRIPTION_API}", self.subscription_url());
        let sub: Subscription = self.call(self.http.get(url)).await?;
        Ok(Identity {
            account_id: sub.subscription_id,
            principal: self.client_id.clone(),
            display_name: sub.display_name,
        })
    }

    async fn fetch_metric(
        &self,
        resource: &ResourceRef,
        query: &MetricQuery,
        range: TimeRange,
    ) -> Result<Vec<Datapoint>, ProviderError> {
        let target = target(query.family);
        let metric = query.name.as_deref().unwrap_or(target.metric);
        let path = self.resource_path(resource, target.resource_type)?;
        let timespan = format!(
            "{}/{}",
            range.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            range.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let url = format!(
            "{MANAGEMENT_BASE}{path}/providers/Microsoft.Insights/metrics?api-version={METRICS_API}&timespan={}&interval={}&metricnames={}&aggregation=Average",
            urlencoding::encode(&timespan),
            target.interval,
            urlencoding::encode(metric),
        );

        let body: Value = self.call(self.http.get(url)).await?;
        let mut points = parse_metrics(&body);
        points.sort_by_key(|p| p.timestamp);
        debug!(metric, resource = %resource.id, points = points.len(), "azure metrics fetched");
        Ok(points)
    }

    async fn fetch_cost(
        &self,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<CostPeriod>, ProviderError> {
        let granularity_name = match granularity {
            Granularity::Daily => "Daily",
            Granularity::Monthly => "Monthly",
        };
        let body = json!({
            "type": "ActualCost",
            "timeframe": "Custom",
            "timePeriod": {
                "from": range.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                "to": range.end.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
            "dataset": {
                "granularity": granularity_name,
                "aggregation": {
                    "totalCost": { "name": "PreTaxCost", "function": "Sum" }
                },
            },
        });

        let mut url = format!(
            "{}/providers/Microsoft.CostManagement/query?api-version={COST_API}",
            self.subscription_url()
        );
        let mut periods = Vec::new();
        loop {
            let page: Value = self.call(self.http.post(&url).json(&body)).await?;
            periods.extend(parse_cost(&page, granularity)?);
            match page["properties"]["nextLink"].as_str() {
                Some(next) if !next.is_empty() => url = next.to_owned(),
                _ => break,
            }
        }
        periods.sort_by_key(|p| p.period_start);
        Ok(periods)
    }

    async fn apply_mutation(&self, mutation: &Mutation) -> Result<MutationOutcome, ProviderError> {
        match mutation {
            Mutation::Scale {
                group,
                desired_capacity,
            } => {
                let (resource_group, name) = self.locate(None, group)?;
                let url = format!(
                    "{}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachineScaleSets/{name}?api-version={COMPUTE_API}",
                    self.subscription_url()
                );
                let _: Value = self
                    .call(
                        self.http
                            .patch(url)
                            .json(&json!({ "sku": { "capacity": desired_capacity } })),
                    )
                    .await?;
                Ok(MutationOutcome {
                    status: "accepted".to_owned(),
                    detail: json!({ "group": group, "desired_capacity": desired_capacity }),
                })
            }
            Mutation::FirewallRule {
                group_id,
                port,
                protocol,
                cidr,
            } => {
                let (resource_group, nsg) = self.locate(None, group_id)?;
                let name = rule_name(protocol, *port, cidr);
                let url = format!(
                    "{}/resourceGroups/{resource_group}/providers/Microsoft.Network/networkSecurityGroups/{nsg}/securityRules/{name}?api-version={NETWORK_API}",
                    self.subscription_url()
                );
                let wire_protocol = if protocol == "udp" { "Udp" } else { "Tcp" };
                let rule = json!({
                    "properties": {
                        "protocol": wire_protocol,
                        "sourcePortRange": "*",
                        "destinationPortRange": port.to_string(),
                        "sourceAddressPrefix": cidr,
                        "destinationAddressPrefix": "*",
                        "access": "Allow",
                        "priority": rule_priority(&name),
                        "direction": "Inbound",
                    }
                });
                let _: Value = self.call(self.http.put(url).json(&rule)).await?;
                Ok(MutationOutcome {
                    status: "accepted".to_owned(),
                    detail: json!({ "group_id": group_id, "rule": name }),
                })
            }
        }
    }
}

fn parse_metrics(body: &Value) -> Vec<Datapoint> {
    let Some(metrics) = body["value"].as_array() else {
        return Vec::new();
    };
    let mut points = Vec::new();
    for metric in metrics {
        let unit = metric["unit"].as_str().unwrap_or("Unspecified");
        let series = metric["timeseries"].as_array().into_iter().flatten();
        for sample in series.filter_map(|s| s["data"].as_array()).flatten() {
            let (Some(ts), Some(value)) = (sample["timeStamp"].as_str(), sample["average"].as_f64())
            else {
                continue;
            };
            let Ok(ts) = DateTime::parse_from_rfc3339(ts) else {
                continue;
            };
            points.push(Datapoint {
                timestamp: ts.with_timezone(&Utc),
                value,
                unit: unit.to_owned(),
            });
        }
    }
    points
}

/// Turn a Cost Management result table into periods.
fn parse_cost(body: &Value, granularity: Granularity) -> Result<Vec<CostPeriod>, ProviderError> {
    let invalid = |what: &str| ProviderError::permanent("InvalidResponse", format!("cost query {what}"));

    let columns: Vec<&str> = body["properties"]["columns"]
        .as_array()
        .ok_or_else(|| invalid("has no columns"))?
        .iter()
        .map(|c| c["name"].as_str().unwrap_or_default())
        .collect();
    let find = |names: &[&str]| columns.iter().position(|c| names.contains(c));
    let cost = find(COST_COLUMNS).ok_or_else(|| invalid("has no cost column"))?;
    let date = find(&["UsageDate", "BillingMonth"]).ok_or_else(|| invalid("has no date column"))?;
    let currency = find(&["Currency"]);

    let Some(rows) = body["properties"]["rows"].as_array() else {
        return Ok(Vec::new());
    };
    let mut periods = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(period_start) = parse_cost_date(&row[date]) else {
            continue;
        };
        let period_end = match granularity {
            Granularity::Daily => period_start.checked_add_days(Days::new(1)),
            Granularity::Monthly => period_start
                .with_day(1)
                .and_then(|d| d.checked_add_months(Months::new(1))),
        }
        .unwrap_or(period_start);
        periods.push(CostPeriod {
            period_start,
            period_end,
            amount: row[cost].as_f64().unwrap_or(0.0),
            currency: currency
                .and_then(|i| row[i].as_str())
                .unwrap_or("USD")
                .to_owned(),
        });
    }
    Ok(periods)
}

/// `UsageDate` is a number like `20250914`; `BillingMonth` is a timestamp
/// string.
fn parse_cost_date(value: &Value) -> Option<NaiveDate> {
    if let Some(n) = value.as_u64() {
        return NaiveDate::parse_from_str(&n.to_string(), "%Y%m%d").ok();
    }
    let raw = value.as_str()?;
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

fn rule_name(protocol: &str, port: u16, cidr: &str) -> String {
    let cidr: String = cidr
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("cloudlens-{protocol}-{port}-{cidr}")
}

/// Stable priority for a rule name. The same rule always lands on the same
/// slot, so re-applying it updates in place.
fn rule_priority(name: &str) -> u32 {
    let hash = name
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
    RULE_PRIORITY_MIN + hash % (RULE_PRIORITY_MAX - RULE_PRIORITY_MIN + 1)
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProviderError> {
    let status = response.status();
    let body = response.bytes().await.map_err(http_error)?;
    if !status.is_success() {
        return Err(status_error(status, &body));
    }
    if body.is_empty() {
        return serde_json::from_value(Value::Null)
            .map_err(|e| ProviderError::permanent("InvalidResponse", e.to_string()));
    }
    serde_json::from_slice(&body).map_err(|e| ProviderError::permanent("InvalidResponse", e.to_string()))
}

/// Map an error response. Both the ARM shape `{"error":{"code","message"}}`
/// and the OAuth shape `{"error":"..","error_description":".."}` are read.
fn status_error(status: StatusCode, body: &[u8]) -> ProviderError {
    let transient = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
    let parsed: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let (code, message) = match &parsed["error"] {
        Value::Object(detail) => (
            detail.get("code").and_then(Value::as_str).map(str::to_owned),
            detail.get("message").and_then(Value::as_str).map(str::to_owned),
        ),
        Value::String(code) => (
            Some(code.clone()),
            parsed["error_description"].as_str().map(str::to_owned),
        ),
        _ => (None, None),
    };
    ProviderError {
        code: code.unwrap_or_else(|| format!("Http{}", status.as_u16())),
        message: message.unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_owned()
        }),
        transient,
    }
}

fn http_error(err: reqwest::Error) -> ProviderError {
    let err = err.without_url();
    if err.is_decode() {
        return ProviderError::permanent("InvalidResponse", err.to_string());
    }
    ProviderError::transient("NetworkError", err.to_string())
}
