//! AWS adapter over the AWS SDK for Rust.
//!
//! Metrics come from CloudWatch `GetMetricStatistics`, cost from Cost
//! Explorer `GetCostAndUsage` (always `us-east-1`), identity from STS
//! `GetCallerIdentity`. Mutations use Auto Scaling `SetDesiredCapacity` and
//! EC2 `AuthorizeSecurityGroupIngress`.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_cloudwatch::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudwatch::types::{Dimension, Statistic};
use aws_sdk_costexplorer::types::{DateInterval, Granularity as CostGranularity};
use aws_sdk_ec2::types::{IpPermission, IpRange};
use aws_sdk_sts::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tracing::debug;

use cloudlens_core::credential::{Credential, Identity, ProviderKind};
use cloudlens_core::error::ProviderError;
use cloudlens_core::provider::{
    CostPeriod, Datapoint, Granularity, MetricFamily, MetricQuery, Mutation, MutationOutcome,
    ProviderAdapter, ResourceRef, TimeRange,
};

use super::required;

const COST_EXPLORER_REGION: &str = "us-east-1";
const COST_METRIC: &str = "UnblendedCost";

/// Service error codes worth a retry.
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "InternalFailure",
    "InternalError",
];

/// CloudWatch coordinates for one metric family.
struct MetricTarget {
    namespace: &'static str,
    metric: &'static str,
    dimension: &'static str,
    period_secs: i32,
    extra: Option<(&'static str, &'static str)>,
}

fn target(family: MetricFamily) -> MetricTarget {
    match family {
        MetricFamily::Compute => MetricTarget {
            namespace: "AWS/EC2",
            metric: "CPUUtilization",
            dimension: "InstanceId",
            period_secs: 60,
            extra: None,
        },
        MetricFamily::Storage => MetricTarget {
            namespace: "AWS/S3",
            metric: "BucketSizeBytes",
            dimension: "BucketName",
            period_secs: 86_400,
            extra: Some(("StorageType", "StandardStorage")),
        },
    }
}

/// An adapter bound to one tenant's access key.
pub struct AwsAdapter {
    config: SdkConfig,
}

impl std::fmt::Debug for AwsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsAdapter")
            .field("region", &self.config.region())
            .finish_non_exhaustive()
    }
}

impl AwsAdapter {
    /// # Errors
    ///
    /// Returns an error if the credential lacks the access key pair.
    pub fn from_credential(credential: &Credential) -> Result<Self, ProviderError> {
        let access_key = required(credential, "access_key")?;
        let secret_key = required(credential, "secret_key")?;
        let region = credential.field("region").unwrap_or("us-east-1");

        let creds = Credentials::new(access_key, secret_key, None, None, "cloudlens-vault");
        let config = SdkConfig::builder()
            .region(Region::new(region.to_owned()))
            .credentials_provider(SharedCredentialsProvider::new(creds))
            .behavior_version(BehaviorVersion::latest())
            .build();
        Ok(Self { config })
    }

    fn cost_explorer(&self) -> aws_sdk_costexplorer::Client {
        let conf = aws_sdk_costexplorer::config::Builder::from(&self.config)
            .region(Region::new(COST_EXPLORER_REGION))
            .build();
        aws_sdk_costexplorer::Client::from_conf(conf)
    }
}

#[async_trait]
impl ProviderAdapter for AwsAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    async fn validate_credential(&self) -> Result<Identity, ProviderError> {
        let out = aws_sdk_sts::Client::new(&self.config)
            .get_caller_identity()
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(Identity {
            account_id: out.account().unwrap_or_default().to_owned(),
            principal: out.arn().unwrap_or_default().to_owned(),
            display_name: None,
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

        let mut dimensions = vec![dimension(target.dimension, &resource.id)?];
        if let Some((name, value)) = target.extra {
            dimensions.push(dimension(name, value)?);
        }

        let out = aws_sdk_cloudwatch::Client::new(&self.config)
            .get_metric_statistics()
            .namespace(target.namespace)
            .metric_name(metric)
            .set_dimensions(Some(dimensions))
            .start_time(AwsDateTime::from_secs(range.start.timestamp()))
            .end_time(AwsDateTime::from_secs(range.end.timestamp()))
            .period(target.period_secs)
            .statistics(Statistic::Average)
            .send()
            .await
            .map_err(sdk_error)?;

        let mut points: Vec<Datapoint> = out
            .datapoints()
            .iter()
            .filter_map(|dp| {
                let ts = dp.timestamp()?;
                Some(Datapoint {
                    timestamp: DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos())?,
                    value: dp.average()?,
                    unit: dp.unit().map_or("None", |u| u.as_str()).to_owned(),
                })
            })
            .collect();
        points.sort_by_key(|p| p.timestamp);
        debug!(metric, resource = %resource.id, points = points.len(), "cloudwatch statistics fetched");
        Ok(points)
    }

    async fn fetch_cost(
        &self,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<CostPeriod>, ProviderError> {
        let start = range.start_date();
        // The end date is exclusive and must follow the start.
        let end = if range.end_date() > start {
            range.end_date()
        } else {
            start.succ_opt().unwrap_or(start)
        };
        let interval = DateInterval::builder()
            .start(start.format("%Y-%m-%d").to_string())
            .end(end.format("%Y-%m-%d").to_string())
            .build()
            .map_err(|e| ProviderError::permanent("InvalidRequest", e.to_string()))?;
        let granularity = match granularity {
            Granularity::Daily => CostGranularity::Daily,
            Granularity::Monthly => CostGranularity::Monthly,
        };

        let client = self.cost_explorer();
        let mut periods = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let out = client
                .get_cost_and_usage()
                .time_period(interval.clone())
                .granularity(granularity.clone())
                .metrics(COST_METRIC)
                .set_next_page_token(page_token.take())
                .send()
                .await
                .map_err(sdk_error)?;

            for result in out.results_by_time() {
                let Some(window) = result.time_period() else {
                    continue;
                };
                let (Ok(period_start), Ok(period_end)) = (
                    NaiveDate::parse_from_str(window.start(), "%Y-%m-%d"),
                    NaiveDate::parse_from_str(window.end(), "%Y-%m-%d"),
                ) else {
                    continue;
                };
                let total = result.total().and_then(|t| t.get(COST_METRIC));
                periods.push(CostPeriod {
                    period_start,
                    period_end,
                    amount: total
                        .and_then(|m| m.amount())
                        .and_then(|a| a.parse().ok())
                        .unwrap_or(0.0),
                    currency: total.and_then(|m| m.unit()).unwrap_or("USD").to_owned(),
                });
            }

            match out.next_page_token() {
                Some(token) if !token.is_empty() => page_token = Some(token.to_owned()),
                _ => break,
            }
        }
        Ok(periods)
    }

    async fn apply_mutation(&self, mutation: &Mutation) -> Result<MutationOutcome, ProviderError> {
        match mutation {
            Mutation::Scale {
                group,
                desired_capacity,
            } => {
                let capacity = i32::try_from(*desired_capacity).map_err(|_| {
                    ProviderError::permanent("InvalidParameter", "desired_capacity is out of range")
                })?;
                aws_sdk_autoscaling::Client::new(&self.config)
                    .set_desired_capacity()
                    .auto_scaling_group_name(group)
                    .desired_capacity(capacity)
                    .honor_cooldown(false)
                    .send()
                    .await
                    .map_err(sdk_error)?;
                Ok(MutationOutcome {
                    status: "ok".to_owned(),
                    detail: json!({ "group": group, "desired_capacity": desired_capacity }),
                })
            }
            Mutation::FirewallRule {
                group_id,
                port,
                protocol,
                cidr,
            } => {
                let permission = IpPermission::builder()
                    .ip_protocol(protocol)
                    .from_port(i32::from(*port))
                    .to_port(i32::from(*port))
                    .ip_ranges(IpRange::builder().cidr_ip(cidr).build())
                    .build();
                aws_sdk_ec2::Client::new(&self.config)
                    .authorize_security_group_ingress()
                    .group_id(group_id)
                    .ip_permissions(permission)
                    .send()
                    .await
                    .map_err(sdk_error)?;
                Ok(MutationOutcome {
                    status: "ok".to_owned(),
                    detail: json!({
                        "group_id": group_id,
                        "rule": format!("{protocol} {port} from {cidr}"),
                    }),
                })
            }
        }
    }
}

fn dimension(name: &str, value: &str) -> Result<Dimension, ProviderError> {
    Dimension::builder()
        .name(name)
        .value(value)
        .build()
        .map_err(|e| ProviderError::permanent("InvalidRequest", e.to_string()))
}

/// Normalize an SDK failure. Transport failures and throttling are transient.
fn sdk_error<E, R>(err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let transport = matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    );
    let message = err
        .message()
        .map_or_else(|| DisplayErrorContext(&err).to_string(), str::to_owned);
    match err.code() {
        Some(code) => ProviderError {
            transient: transport || TRANSIENT_CODES.contains(&code),
            code: code.to_owned(),
            message,
        },
        None if transport => ProviderError::transient("NetworkError", message),
        None => ProviderError::permanent("AwsError", message),
    }
}
