//! Storage layer for CostWatch
//!
//! Raw usage lives in a columnar analytics store (ClickHouse), everything
//! stateful the engines own (watermarks, alert rules, notification state)
//! lives in SQLite. In-memory implementations back tests and ephemeral runs.

mod clickhouse;
mod memory;
mod sqlite;

pub use self::clickhouse::ClickHouseStore;
pub use memory::{MemoryAlertRepository, MemoryMetricsStore, MemoryWatermarks};
pub use sqlite::SqliteStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::models::{MetricBucket, MetricPercentiles, UsageRecord};

/// Read side of the analytics store
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    /// Usage summed per `(service, metric, bucket)` for `start <= ts < end`,
    /// ordered by service, metric, then bucket start
    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> Result<Vec<MetricBucket>>;

    /// Percentiles of the per-bucket sums for each service/metric
    async fn percentiles(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> Result<Vec<MetricPercentiles>>;
}

/// Write side of the analytics store
///
/// A record replaces any earlier record with the same service, metric and
/// timestamp.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn write_batch(&self, records: &[UsageRecord]) -> Result<()>;
}

/// Per service/metric sync progress
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Instant through which usage has been ingested, if any
    async fn get(&self, service: &str, metric: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record progress; never moves an existing watermark backwards
    async fn set(&self, service: &str, metric: &str, at: DateTime<Utc>) -> Result<()>;
}
