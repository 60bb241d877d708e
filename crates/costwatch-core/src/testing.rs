//! Test doubles shared by unit tests across modules

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::alerting::Notifier;
use crate::collector::{Catalog, Metric, Pricing};
use crate::db::{MetricsRepository, UsageSink};
use crate::error::{Error, Result};
use crate::models::{Datapoint, MetricBucket, MetricPercentiles, UsageRecord};

/// Static price table keyed by service and metric
#[derive(Debug, Clone, Default)]
pub struct PriceList {
    pricing: HashMap<(String, String), Pricing>,
}

impl PriceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pricing(mut self, service: &str, metric: &str, pricing: Pricing) -> Self {
        self.pricing
            .insert((service.to_string(), metric.to_string()), pricing);
        self
    }
}

impl Catalog for PriceList {
    fn compute_cost(&self, service: &str, metric: &str, units: f64) -> Option<f64> {
        self.pricing
            .get(&(service.to_string(), metric.to_string()))?
            .cost(units)
    }
}

/// Metric returning canned datapoints and recording requested ranges
pub struct StubMetric {
    pub label: String,
    pub pricing: Pricing,
    pub points: Vec<Datapoint>,
    pub fail: Arc<AtomicBool>,
    pub calls: Arc<Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>>,
}

impl StubMetric {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            pricing: Pricing::new(1.0, 1.0),
            points: Vec::new(),
            fail: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_points(mut self, points: Vec<Datapoint>) -> Self {
        self.points = points;
        self
    }

    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Metric for StubMetric {
    fn label(&self) -> &str {
        &self.label
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }

    async fn datapoints(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Datapoint>> {
        self.calls.lock().push((start, end));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::provider(format!("{} unavailable", self.label)));
        }
        Ok(self
            .points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp < end)
            .copied()
            .collect())
    }
}

/// Catalog wrapper counting lookups; can refuse one exact unit value
pub struct CountingCatalog<C> {
    inner: C,
    fail_on: Option<f64>,
    calls: AtomicUsize,
}

impl<C: Catalog> CountingCatalog<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            fail_on: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(inner: C, units: f64) -> Self {
        Self {
            fail_on: Some(units),
            ..Self::new(inner)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<C: Catalog> Catalog for CountingCatalog<C> {
    fn compute_cost(&self, service: &str, metric: &str, units: f64) -> Option<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on == Some(units) {
            return None;
        }
        self.inner.compute_cost(service, metric, units)
    }
}

/// Metrics repository serving fixed buckets and counting reads
pub struct CountingMetrics {
    rows: Vec<MetricBucket>,
    aggregate_calls: AtomicUsize,
}

impl CountingMetrics {
    pub fn new(rows: Vec<MetricBucket>) -> Self {
        Self {
            rows,
            aggregate_calls: AtomicUsize::new(0),
        }
    }

    pub fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsRepository for CountingMetrics {
    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _bucket: Duration,
    ) -> Result<Vec<MetricBucket>> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect())
    }

    async fn percentiles(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _bucket: Duration,
    ) -> Result<Vec<MetricPercentiles>> {
        Ok(Vec::new())
    }
}

/// Sink that always fails
pub struct FailingSink;

#[async_trait]
impl UsageSink for FailingSink {
    async fn write_batch(&self, _records: &[UsageRecord]) -> Result<()> {
        Err(Error::internal("sink offline"))
    }
}

/// Notifier recording every message; can be switched to fail
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    /// Sends tried, failed ones included
    pub attempts: AtomicUsize,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::notification("webhook down"));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}
