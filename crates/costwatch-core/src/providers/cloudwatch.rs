//! AWS CloudWatch Logs ingestion volume

use async_trait::async_trait;
use aws_sdk_cloudwatch::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudwatch::types::Statistic;
use aws_sdk_cloudwatch::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::collector::{BillableService, Metric, Pricing};
use crate::config::CloudWatchConfig;
use crate::error::{Error, Result};
use crate::models::Datapoint;

/// Service label of the CloudWatch provider
pub const CLOUDWATCH_SERVICE: &str = "aws.CloudWatch";

/// 50 per GB ingested
const PRICE: f64 = 50.0;
const UNITS_PER_PRICE: f64 = 1e9;

/// `IncomingBytes` summed per statistic period
pub struct IncomingBytes {
    client: Client,
    namespace: String,
    period_secs: i32,
}

impl IncomingBytes {
    pub fn new(client: Client, config: &CloudWatchConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            period_secs: config.period_secs,
        }
    }

    /// Client from the default AWS credential chain
    pub async fn from_env(config: &CloudWatchConfig) -> Self {
        let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&aws), config)
    }

    pub fn service(self) -> BillableService {
        BillableService::new(CLOUDWATCH_SERVICE).with_metric(self)
    }
}

#[async_trait]
impl Metric for IncomingBytes {
    fn label(&self) -> &str {
        "IncomingBytes"
    }

    fn pricing(&self) -> Pricing {
        Pricing::new(PRICE, UNITS_PER_PRICE)
    }

    async fn datapoints(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Datapoint>> {
        let out = self
            .client
            .get_metric_statistics()
            .namespace(&self.namespace)
            .metric_name(self.label())
            .period(self.period_secs)
            .start_time(AwsDateTime::from_millis(start.timestamp_millis()))
            .end_time(AwsDateTime::from_millis(end.timestamp_millis()))
            .statistics(Statistic::Sum)
            .send()
            .await
            .map_err(|e| Error::provider(format!("cloudwatch GetMetricStatistics: {e}")))?;

        let points: Vec<Datapoint> = out
            .datapoints()
            .iter()
            .filter_map(|dp| {
                let ts = DateTime::from_timestamp_millis(dp.timestamp()?.to_millis().ok()?)?;
                Some(Datapoint::new(ts, dp.sum()?))
            })
            .filter(|p| p.timestamp >= start && p.timestamp < end)
            .collect();

        debug!(points = points.len(), "Fetched CloudWatch datapoints");
        Ok(points)
    }
}
