//! Cost views over aggregated usage, served by the read API

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::collector::Catalog;
use crate::db::MetricsRepository;
use crate::error::{Error, Result};
use crate::models::{PercentileCost, QueryResult, UsageItem};

/// Default range of the usage and alert window views, in days
pub const DEFAULT_USAGE_DAYS: i64 = 28;
/// Default range of the percentile view, in days
pub const DEFAULT_PERCENTILE_DAYS: i64 = 7;
/// Default bucket width in seconds
pub const DEFAULT_INTERVAL_SECS: i64 = 3600;

/// Converts bucketed usage into cost rows
#[derive(Clone)]
pub struct UsageService {
    metrics: Arc<dyn MetricsRepository>,
    catalog: Arc<dyn Catalog>,
}

impl UsageService {
    pub fn new(metrics: Arc<dyn MetricsRepository>, catalog: Arc<dyn Catalog>) -> Self {
        Self { metrics, catalog }
    }

    /// Cost per bucket for every service/metric in `[from, to)`.
    ///
    /// Buckets whose cost cannot be computed are left out.
    pub async fn usage(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Duration,
    ) -> Result<QueryResult<UsageItem>> {
        check_range(from, to, interval)?;

        let rows = self.metrics.aggregate(from, to, interval).await?;
        let total = rows.len();
        let items: Vec<UsageItem> = rows
            .into_iter()
            .filter_map(|row| {
                let cost = self
                    .catalog
                    .compute_cost(&row.service, &row.metric, row.units)?;
                Some(UsageItem {
                    service: row.service,
                    metric: row.metric,
                    timestamp: row.timestamp,
                    cost,
                })
            })
            .collect();

        if items.len() < total {
            debug!(skipped = total - items.len(), "Skipped buckets without a cost");
        }
        Ok(QueryResult {
            from_date: from,
            to_date: to,
            interval: interval.num_seconds(),
            items,
        })
    }

    /// Per-bucket cost percentiles for every service/metric in `[from, to)`
    pub async fn percentiles(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Duration,
    ) -> Result<QueryResult<PercentileCost>> {
        check_range(from, to, interval)?;

        let rows = self.metrics.percentiles(from, to, interval).await?;
        let items = rows
            .into_iter()
            .filter_map(|row| {
                let cost = |units| self.catalog.compute_cost(&row.service, &row.metric, units);
                Some(PercentileCost {
                    p50: cost(row.p50)?,
                    p90: cost(row.p90)?,
                    p95: cost(row.p95)?,
                    pmax: cost(row.pmax)?,
                    service: row.service.clone(),
                    metric: row.metric.clone(),
                })
            })
            .collect();

        Ok(QueryResult {
            from_date: from,
            to_date: to,
            interval: interval.num_seconds(),
            items,
        })
    }
}

fn check_range(from: DateTime<Utc>, to: DateTime<Utc>, interval: Duration) -> Result<()> {
    if from >= to {
        return Err(Error::validation("`from` must be before `to`"));
    }
    if interval <= Duration::zero() {
        return Err(Error::validation("interval must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Pricing;
    use crate::testing::PriceList;
    use crate::db::{MemoryMetricsStore, UsageSink};
    use crate::models::UsageRecord;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    async fn service(records: &[(&str, u32, u32, f64)]) -> UsageService {
        let store = Arc::new(MemoryMetricsStore::new());
        let records: Vec<_> = records
            .iter()
            .map(|&(metric, h, m, value)| UsageRecord {
                service: "aws.CloudWatch".into(),
                metric: metric.into(),
                value,
                timestamp: at(h, m),
            })
            .collect();
        store.write_batch(&records).await.unwrap();

        let prices = PriceList::new()
            .with_pricing("aws.CloudWatch", "IncomingBytes", Pricing::new(50.0, 1e9))
            .with_pricing("aws.CloudWatch", "Broken", Pricing::new(50.0, 0.0));
        UsageService::new(store, Arc::new(prices))
    }

    #[tokio::test]
    async fn usage_is_bucketed_and_priced() {
        let svc = service(&[
            ("IncomingBytes", 0, 0, 2.5e8),
            ("IncomingBytes", 0, 15, 2.5e8),
            ("IncomingBytes", 1, 30, 1e9),
        ])
        .await;

        let result = svc.usage(at(0, 0), at(2, 0), Duration::hours(1)).await.unwrap();

        assert_eq!(result.interval, 3600);
        let costs: Vec<_> = result.items.iter().map(|i| (i.timestamp, i.cost)).collect();
        assert_eq!(costs, vec![(at(0, 0), 25.0), (at(1, 0), 50.0)]);
    }

    #[tokio::test]
    async fn uncomputable_buckets_are_skipped() {
        let svc = service(&[("IncomingBytes", 0, 0, 1e9), ("Broken", 0, 0, 1e9)]).await;

        let result = svc.usage(at(0, 0), at(1, 0), Duration::hours(1)).await.unwrap();

        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].metric, "IncomingBytes");
    }

    #[tokio::test]
    async fn percentiles_are_priced() {
        let svc = service(&[
            ("IncomingBytes", 0, 0, 1e9),
            ("IncomingBytes", 1, 0, 2e9),
            ("IncomingBytes", 2, 0, 4e9),
        ])
        .await;

        let result = svc
            .percentiles(at(0, 0), at(3, 0), Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(result.items.len(), 1);
        let p = &result.items[0];
        assert_eq!(p.pmax, 200.0);
        assert!(p.p50 <= p.p90 && p.p90 <= p.p95 && p.p95 <= p.pmax);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let svc = service(&[]).await;
        let err = svc
            .usage(at(2, 0), at(1, 0), Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
