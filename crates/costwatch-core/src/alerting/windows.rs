//! Alert window detection
//!
//! A window is a maximal run of contiguous buckets of one service/metric
//! whose cost exceeded the rule threshold. Any bucket at or under the
//! threshold, a missing bucket, or a change of series closes the window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::collector::{round_cents, Catalog};
use crate::db::MetricsRepository;
use crate::error::Result;
use crate::models::{AlertRule, AlertWindow, MetricBucket};

/// Computes alert windows from aggregated usage and the configured rules
#[derive(Clone)]
pub struct AlertWindowEngine {
    metrics: Arc<dyn MetricsRepository>,
    rules: Arc<dyn super::AlertRepository>,
    catalog: Arc<dyn Catalog>,
}

impl AlertWindowEngine {
    pub fn new(
        metrics: Arc<dyn MetricsRepository>,
        rules: Arc<dyn super::AlertRepository>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            metrics,
            rules,
            catalog,
        }
    }

    /// Windows in `[start, end)`, most recent first
    ///
    /// Returns immediately when no rules are configured.
    pub async fn compute_windows(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> Result<Vec<AlertWindow>> {
        let rules = self.rules.list_rules().await?;
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.metrics.aggregate(start, end, bucket).await?;
        let windows = detect_windows(&rows, &rules, self.catalog.as_ref(), bucket);

        debug!(
            rules = rules.len(),
            buckets = rows.len(),
            windows = windows.len(),
            "Computed alert windows"
        );
        Ok(windows)
    }
}

/// Single pass over buckets ordered by service, metric and time
pub fn detect_windows(
    rows: &[MetricBucket],
    rules: &[AlertRule],
    catalog: &dyn Catalog,
    bucket: Duration,
) -> Vec<AlertWindow> {
    let thresholds: HashMap<(&str, &str), f64> = rules
        .iter()
        .map(|r| ((r.service.as_str(), r.metric.as_str()), r.threshold))
        .collect();

    let mut windows = Vec::new();
    let mut open: Option<AlertWindow> = None;

    for row in rows {
        if open
            .as_ref()
            .is_some_and(|w| w.service != row.service || w.metric != row.metric)
        {
            close(&mut open, &mut windows);
        }

        let Some(&threshold) = thresholds.get(&(row.service.as_str(), row.metric.as_str()))
        else {
            continue;
        };

        let Some(cost) = catalog.compute_cost(&row.service, &row.metric, row.units) else {
            debug!(
                service = %row.service,
                metric = %row.metric,
                timestamp = %row.timestamp,
                "Skipping bucket without computable cost"
            );
            continue;
        };

        if cost <= threshold {
            close(&mut open, &mut windows);
            continue;
        }

        match open.as_mut() {
            Some(w) if row.timestamp == w.end => {
                w.end = row.timestamp + bucket;
                w.hours += 1;
                w.real_cost += cost;
            }
            _ => {
                close(&mut open, &mut windows);
                open = Some(AlertWindow {
                    service: row.service.clone(),
                    metric: row.metric.clone(),
                    start: row.timestamp,
                    end: row.timestamp + bucket,
                    hours: 1,
                    real_cost: cost,
                    threshold,
                });
            }
        }
    }
    close(&mut open, &mut windows);

    windows.sort_by(|a, b| b.start.cmp(&a.start));
    windows
}

fn close(open: &mut Option<AlertWindow>, windows: &mut Vec<AlertWindow>) {
    if let Some(mut w) = open.take() {
        w.real_cost = round_cents(w.real_cost);
        windows.push(w);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Pricing;
    use crate::db::MemoryAlertRepository;
    use crate::testing::{CountingCatalog, CountingMetrics, PriceList};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    fn row(service: &str, h: i64, units: f64) -> MetricBucket {
        MetricBucket {
            service: service.into(),
            metric: "m".into(),
            timestamp: hour(h),
            units,
        }
    }

    /// One unit costs one currency unit
    fn unit_prices(services: &[&str]) -> PriceList {
        services.iter().fold(PriceList::new(), |list, s| {
            list.with_pricing(s, "m", Pricing::new(1.0, 1.0))
        })
    }

    #[test]
    fn dip_closes_window() {
        let rows: Vec<_> = [12.0, 15.0, 15.0, 15.0, 4.0, 20.0]
            .into_iter()
            .enumerate()
            .map(|(h, units)| row("svc", h as i64, units))
            .collect();
        let rules = [AlertRule::new("svc", "m", 10.0)];

        let prices = unit_prices(&["svc"]);
        let windows = detect_windows(&rows, &rules, &prices, Duration::hours(1));

        assert_eq!(windows.len(), 2);
        // most recent first
        assert_eq!((windows[0].start, windows[0].end), (hour(5), hour(6)));
        assert_eq!((windows[0].hours, windows[0].real_cost), (1, 20.0));
        assert_eq!((windows[1].start, windows[1].end), (hour(0), hour(4)));
        assert_eq!((windows[1].hours, windows[1].real_cost), (4, 57.0));
        assert_eq!(windows[1].expected_cost(), 40.0);
    }

    #[test]
    fn gap_splits_window() {
        let rows = vec![row("svc", 0, 20.0), row("svc", 1, 20.0), row("svc", 3, 20.0)];
        let rules = [AlertRule::new("svc", "m", 10.0)];

        let prices = unit_prices(&["svc"]);
        let windows = detect_windows(&rows, &rules, &prices, Duration::hours(1));

        let spans: Vec<_> = windows.iter().map(|w| (w.start, w.hours)).collect();
        assert_eq!(spans, vec![(hour(3), 1), (hour(0), 2)]);
    }

    #[test]
    fn threshold_is_exclusive() {
        let rows = vec![row("svc", 0, 10.0), row("svc", 1, 10.01)];
        let rules = [AlertRule::new("svc", "m", 10.0)];

        let prices = unit_prices(&["svc"]);
        let windows = detect_windows(&rows, &rules, &prices, Duration::hours(1));

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, hour(1));
    }

    #[test]
    fn series_never_merge() {
        // interleaved on purpose: even out-of-order input must not join keys
        let rows = vec![
            row("a", 0, 20.0),
            row("b", 1, 20.0),
            row("a", 2, 20.0),
            row("b", 3, 20.0),
        ];
        let rules = [AlertRule::new("a", "m", 10.0), AlertRule::new("b", "m", 10.0)];

        let prices = unit_prices(&["a", "b"]);
        let windows = detect_windows(&rows, &rules, &prices, Duration::hours(1));

        assert_eq!(windows.len(), 4);
        assert!(windows.iter().all(|w| w.hours == 1));
    }

    #[test]
    fn adjacent_series_stay_separate() {
        // a's last bucket ends exactly where b's first bucket starts
        let rows = vec![row("a", 0, 20.0), row("a", 1, 20.0), row("b", 2, 20.0)];
        let rules = [AlertRule::new("a", "m", 10.0), AlertRule::new("b", "m", 10.0)];

        let prices = unit_prices(&["a", "b"]);
        let windows = detect_windows(&rows, &rules, &prices, Duration::hours(1));

        let keys: Vec<_> = windows
            .iter()
            .map(|w| (w.service.as_str(), w.hours))
            .collect();
        assert_eq!(keys, vec![("b", 1), ("a", 2)]);
    }

    #[test]
    fn uncomputable_bucket_breaks_contiguity() {
        let rows = vec![row("svc", 0, 20.0), row("svc", 1, 30.0), row("svc", 2, 20.0)];
        let rules = [AlertRule::new("svc", "m", 10.0)];
        let catalog = CountingCatalog::failing_on(unit_prices(&["svc"]), 30.0);

        let windows = detect_windows(&rows, &rules, &catalog, Duration::hours(1));

        let spans: Vec<_> = windows.iter().map(|w| (w.start, w.hours)).collect();
        assert_eq!(spans, vec![(hour(2), 1), (hour(0), 1)]);
    }

    #[test]
    fn series_without_rule_is_ignored() {
        let rows = vec![row("a", 0, 20.0), row("other", 0, 99.0)];
        let rules = [AlertRule::new("a", "m", 10.0)];

        let prices = unit_prices(&["a", "other"]);
        let windows = detect_windows(&rows, &rules, &prices, Duration::hours(1));

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].service, "a");
    }

    #[tokio::test]
    async fn no_rules_short_circuits() {
        let metrics = Arc::new(CountingMetrics::new(vec![row("svc", 0, 99.0)]));
        let catalog = Arc::new(CountingCatalog::new(unit_prices(&["svc"])));
        let engine = AlertWindowEngine::new(
            metrics.clone(),
            Arc::new(MemoryAlertRepository::new()),
            catalog.clone(),
        );

        let windows = engine
            .compute_windows(hour(0), hour(48), Duration::hours(1))
            .await
            .unwrap();

        assert!(windows.is_empty());
        assert_eq!(metrics.aggregate_calls(), 0);
        assert_eq!(catalog.calls(), 0);
    }

    #[tokio::test]
    async fn engine_reads_rules_and_buckets() {
        let metrics = Arc::new(CountingMetrics::new(vec![row("svc", 0, 99.0)]));
        let catalog = Arc::new(CountingCatalog::new(unit_prices(&["svc"])));
        let engine = AlertWindowEngine::new(
            metrics.clone(),
            Arc::new(MemoryAlertRepository::with_rules([AlertRule::new("svc", "m", 1.0)])),
            catalog.clone(),
        );

        let windows = engine
            .compute_windows(hour(0), hour(48), Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(windows.len(), 1);
        assert_eq!(metrics.aggregate_calls(), 1);
        assert_eq!(catalog.calls(), 1);
    }
}
