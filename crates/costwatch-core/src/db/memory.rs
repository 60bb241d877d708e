//! In-memory stores for tests and `--ephemeral` runs

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::alerting::AlertRepository;
use crate::error::Result;
use crate::models::{truncate, AlertRule, MetricBucket, MetricPercentiles, UsageRecord};

use super::{MetricsRepository, UsageSink, WatermarkStore};

type SeriesKey = (String, String);

/// Usage kept in a map keyed by service, metric and timestamp
#[derive(Default)]
pub struct MemoryMetricsStore {
    rows: RwLock<BTreeMap<(String, String, DateTime<Utc>), f64>>,
    exclude_services: Vec<String>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide these services from aggregation queries
    pub fn with_excluded_services(mut self, services: Vec<String>) -> Self {
        self.exclude_services = services;
        self
    }

    /// Number of stored rows
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn bucketed(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> BTreeMap<(String, String, DateTime<Utc>), f64> {
        let rows = self.rows.read();
        let mut buckets = BTreeMap::new();
        for ((service, metric, ts), value) in rows.iter() {
            if *ts < start || *ts >= end || self.exclude_services.contains(service) {
                continue;
            }
            *buckets
                .entry((service.clone(), metric.clone(), truncate(*ts, bucket)))
                .or_insert(0.0) += value;
        }
        buckets
    }
}

#[async_trait]
impl UsageSink for MemoryMetricsStore {
    async fn write_batch(&self, records: &[UsageRecord]) -> Result<()> {
        let mut rows = self.rows.write();
        for r in records {
            rows.insert((r.service.clone(), r.metric.clone(), r.timestamp), r.value);
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsRepository for MemoryMetricsStore {
    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> Result<Vec<MetricBucket>> {
        Ok(self
            .bucketed(start, end, bucket)
            .into_iter()
            .map(|((service, metric, timestamp), units)| MetricBucket {
                service,
                metric,
                timestamp,
                units,
            })
            .collect())
    }

    async fn percentiles(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> Result<Vec<MetricPercentiles>> {
        let mut series: BTreeMap<SeriesKey, Vec<f64>> = BTreeMap::new();
        for ((service, metric, _), units) in self.bucketed(start, end, bucket) {
            series.entry((service, metric)).or_default().push(units);
        }

        Ok(series
            .into_iter()
            .map(|((service, metric), mut sums)| {
                sums.sort_by(f64::total_cmp);
                MetricPercentiles {
                    service,
                    metric,
                    p50: quantile_exact(&sums, 0.5),
                    p90: quantile_exact(&sums, 0.9),
                    p95: quantile_exact(&sums, 0.95),
                    pmax: sums.last().copied().unwrap_or_default(),
                }
            })
            .collect())
    }
}

/// Element at `floor(level * n)` of sorted values, clamped to the last one
fn quantile_exact(sorted: &[f64], level: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((level * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Watermarks held in a map
#[derive(Default)]
pub struct MemoryWatermarks {
    marks: RwLock<HashMap<SeriesKey, DateTime<Utc>>>,
}

impl MemoryWatermarks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarks {
    async fn get(&self, service: &str, metric: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .marks
            .read()
            .get(&(service.to_string(), metric.to_string()))
            .copied())
    }

    async fn set(&self, service: &str, metric: &str, at: DateTime<Utc>) -> Result<()> {
        self.marks
            .write()
            .entry((service.to_string(), metric.to_string()))
            .and_modify(|current| *current = (*current).max(at))
            .or_insert(at);
        Ok(())
    }
}

/// Writable rule store with notification state, held in memory
#[derive(Default)]
pub struct MemoryAlertRepository {
    rules: RwLock<BTreeMap<SeriesKey, f64>>,
    notified: RwLock<HashMap<SeriesKey, DateTime<Utc>>>,
}

impl MemoryAlertRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = AlertRule>) -> Self {
        let repo = Self::default();
        {
            let mut map = repo.rules.write();
            for rule in rules {
                map.insert((rule.service, rule.metric), rule.threshold);
            }
        }
        repo
    }
}

#[async_trait]
impl AlertRepository for MemoryAlertRepository {
    async fn list_rules(&self) -> Result<Vec<AlertRule>> {
        Ok(self
            .rules
            .read()
            .iter()
            .map(|((service, metric), threshold)| AlertRule::new(service, metric, *threshold))
            .collect())
    }

    async fn upsert_rule(&self, rule: &AlertRule) -> Result<()> {
        rule.validate()?;
        self.rules
            .write()
            .insert((rule.service.clone(), rule.metric.clone()), rule.threshold);
        Ok(())
    }

    async fn get_last_notified(&self, service: &str, metric: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .notified
            .read()
            .get(&(service.to_string(), metric.to_string()))
            .copied())
    }

    async fn set_last_notified(&self, service: &str, metric: &str, at: DateTime<Utc>) -> Result<()> {
        self.notified
            .write()
            .insert((service.to_string(), metric.to_string()), at);
        Ok(())
    }
}
