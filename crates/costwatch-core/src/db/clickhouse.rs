//! ClickHouse analytics store
//!
//! Raw datapoints land in a `ReplacingMergeTree` keyed by
//! `(service, metric, timestamp)`, so a re-fetched datapoint replaces the
//! earlier copy instead of adding to it. Reads use `FINAL` to see the
//! deduplicated view before background merges have run.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AnalyticsConfig;
use crate::error::Result;
use crate::models::{MetricBucket, MetricPercentiles, UsageRecord};

use super::{MetricsRepository, UsageSink};

#[derive(Debug, Row, Serialize, Deserialize)]
struct MetricRow {
    service: String,
    metric: String,
    value: f64,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    timestamp: DateTime<Utc>,
}

impl From<&UsageRecord> for MetricRow {
    fn from(r: &UsageRecord) -> Self {
        Self {
            service: r.service.clone(),
            metric: r.metric.clone(),
            value: r.value,
            timestamp: r.timestamp,
        }
    }
}

#[derive(Debug, Row, Deserialize)]
struct BucketRow {
    service: String,
    metric: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    ts: DateTime<Utc>,
    units: f64,
}

#[derive(Debug, Row, Deserialize)]
struct PercentileRow {
    service: String,
    metric: String,
    p50: f64,
    p90: f64,
    p95: f64,
    pmax: f64,
}

/// Usage store backed by ClickHouse
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    database: String,
    exclude_services: Vec<String>,
}

impl ClickHouseStore {
    /// Connect, creating the database and `metrics` table when missing
    pub async fn connect(config: &AnalyticsConfig) -> Result<Self> {
        let mut base = Client::default()
            .with_url(&config.url)
            .with_user(&config.user);
        if let Some(password) = &config.password {
            base = base.with_password(password);
        }

        base.query(&format!(
            "CREATE DATABASE IF NOT EXISTS `{}`",
            config.database
        ))
        .execute()
        .await?;

        let store = Self {
            client: base.with_database(&config.database),
            database: config.database.clone(),
            exclude_services: config.exclude_services.clone(),
        };
        store.migrate().await?;

        info!(url = %config.url, database = %config.database, "Connected to ClickHouse");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        self.client
            .query(&format!(
                "CREATE TABLE IF NOT EXISTS `{}`.metrics (
                    service LowCardinality(String),
                    metric LowCardinality(String),
                    value Float64,
                    timestamp DateTime64(3, 'UTC')
                ) ENGINE = ReplacingMergeTree()
                PARTITION BY toYYYYMM(timestamp)
                ORDER BY (service, metric, timestamp)
                TTL toDateTime(timestamp) + INTERVAL 90 DAY",
                self.database
            ))
            .execute()
            .await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }

    fn bucket_query(&self) -> String {
        bucket_sql(!self.exclude_services.is_empty())
    }

    fn bind_range(
        &self,
        sql: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> clickhouse::query::Query {
        let mut query = self
            .client
            .query(sql)
            .bind(bucket.num_seconds())
            .bind(start.timestamp_millis())
            .bind(end.timestamp_millis());
        if !self.exclude_services.is_empty() {
            query = query.bind(&self.exclude_services);
        }
        query
    }
}

/// Per-bucket sums. Binds: bucket seconds, start millis, end millis and,
/// when `excluding`, the excluded service list.
fn bucket_sql(excluding: bool) -> String {
    let exclude = if excluding {
        "AND NOT has(?, service)"
    } else {
        ""
    };
    format!(
        "SELECT service, metric,
            toDateTime64(toStartOfInterval(timestamp, toIntervalSecond(?)), 3, 'UTC') AS ts,
            sum(value) AS units
        FROM metrics FINAL
        WHERE timestamp >= fromUnixTimestamp64Milli(toInt64(?), 'UTC')
          AND timestamp < fromUnixTimestamp64Milli(toInt64(?), 'UTC')
          {exclude}
        GROUP BY service, metric, ts"
    )
}

#[async_trait]
impl UsageSink for ClickHouseStore {
    async fn write_batch(&self, records: &[UsageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut insert = self.client.insert::<MetricRow>("metrics").await?;
        for record in records {
            insert.write(&MetricRow::from(record)).await?;
        }
        insert.end().await?;

        debug!(rows = records.len(), "Inserted usage rows");
        Ok(())
    }
}

#[async_trait]
impl MetricsRepository for ClickHouseStore {
    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> Result<Vec<MetricBucket>> {
        let sql = format!("{} ORDER BY service, metric, ts", self.bucket_query());
        let rows: Vec<BucketRow> = self
            .bind_range(&sql, start, end, bucket)
            .fetch_all()
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| MetricBucket {
                service: r.service,
                metric: r.metric,
                timestamp: r.ts,
                units: r.units,
            })
            .collect())
    }

    async fn percentiles(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> Result<Vec<MetricPercentiles>> {
        let sql = format!(
            "SELECT service, metric,
                quantileExact(0.5)(units) AS p50,
                quantileExact(0.9)(units) AS p90,
                quantileExact(0.95)(units) AS p95,
                max(units) AS pmax
            FROM ({})
            GROUP BY service, metric
            ORDER BY service, metric",
            self.bucket_query()
        );
        let rows: Vec<PercentileRow> = self
            .bind_range(&sql, start, end, bucket)
            .fetch_all()
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| MetricPercentiles {
                service: r.service,
                metric: r.metric,
                p50: r.p50,
                p90: r.p90,
                p95: r.p95,
                pmax: r.pmax,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_sql_reads_deduplicated_rows() {
        let sql = bucket_sql(false);
        assert!(sql.contains("FROM metrics FINAL"));
        assert_eq!(sql.matches('?').count(), 3);
        assert!(!sql.contains("has("));
    }

    #[test]
    fn bucket_sql_binds_exclusions_last() {
        let sql = bucket_sql(true);
        assert_eq!(sql.matches('?').count(), 4);
        assert!(sql.trim_end().ends_with("GROUP BY service, metric, ts"));
        assert!(sql.contains("AND NOT has(?, service)"));
    }
}
