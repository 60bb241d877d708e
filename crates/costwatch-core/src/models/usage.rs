//! Usage data models

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// A single raw sample reported by a provider
///
/// `value` is the usage accumulated over the provider's sampling period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Datapoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A raw datapoint tagged with its service and metric, as written to the
/// analytics store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub service: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(service: &str, metric: &str, datapoint: Datapoint) -> Self {
        Self {
            service: service.to_string(),
            metric: metric.to_string(),
            value: datapoint.value,
            timestamp: datapoint.timestamp,
        }
    }
}

/// Usage summed into one fixed-width bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBucket {
    pub service: String,
    pub metric: String,
    /// Bucket start
    pub timestamp: DateTime<Utc>,
    pub units: f64,
}

/// Percentiles of per-bucket usage for one service/metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPercentiles {
    pub service: String,
    pub metric: String,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub pmax: f64,
}

/// Cost of one bucket, as returned by the usage API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageItem {
    pub service: String,
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub cost: f64,
}

/// Percentiles converted to cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileCost {
    pub service: String,
    pub metric: String,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub pmax: f64,
}

/// Envelope shared by the read endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult<T> {
    pub from_date: DateTime<Utc>,
    pub to_date: DateTime<Utc>,
    /// Bucket width in seconds
    pub interval: i64,
    pub items: Vec<T>,
}

/// Floor `ts` to a multiple of `bucket` since the Unix epoch.
///
/// Falls back to `ts` for a zero or out-of-range bucket.
pub fn truncate(ts: DateTime<Utc>, bucket: Duration) -> DateTime<Utc> {
    ts.duration_trunc(bucket).unwrap_or(ts)
}
