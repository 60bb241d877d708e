//! Notification dispatch for recent alert windows

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::config::AlertingConfig;
use crate::error::{Error, Result};
use crate::models::AlertWindow;

use super::notifier::Notifier;
use super::repository::AlertRepository;
use super::windows::AlertWindowEngine;

/// Time spans the dispatcher works with
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    /// History scanned for windows
    pub lookback: Duration,
    /// Bucket width
    pub bucket: Duration,
    /// Only windows ending after `now - recent` are notified
    pub recent: Duration,
    /// Minimum time between two notifications for one service/metric
    pub dedupe_interval: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            lookback: Duration::hours(48),
            bucket: Duration::hours(1),
            recent: Duration::hours(2),
            dedupe_interval: Duration::hours(1),
        }
    }
}

impl DispatchPolicy {
    pub fn from_config(config: &AlertingConfig) -> Result<Self> {
        Ok(Self {
            lookback: chrono_duration(config.lookback)?,
            bucket: chrono_duration(config.bucket)?,
            recent: chrono_duration(config.recent)?,
            dedupe_interval: chrono_duration(config.dedupe_interval)?,
        })
    }
}

pub(crate) fn chrono_duration(d: std::time::Duration) -> Result<Duration> {
    Duration::from_std(d).map_err(|e| Error::config(format!("duration out of range: {e}")))
}

/// Outcome of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Recent windows considered
    pub windows: usize,
    pub posted: usize,
    /// Skipped because the key was notified within the dedupe interval
    pub skipped_recent: usize,
    pub failed: usize,
}

/// Sends alerts for recent windows, at most once per key per dedupe interval
pub struct NotificationDispatcher {
    windows: AlertWindowEngine,
    alerts: Arc<dyn AlertRepository>,
    notifier: Arc<dyn Notifier>,
    policy: DispatchPolicy,
}

impl NotificationDispatcher {
    pub fn new(
        windows: AlertWindowEngine,
        alerts: Arc<dyn AlertRepository>,
        notifier: Arc<dyn Notifier>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            windows,
            alerts,
            notifier,
            policy,
        }
    }

    pub async fn dispatch(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let windows = self
            .windows
            .compute_windows(now - self.policy.lookback, now, self.policy.bucket)
            .await?;

        let cutoff = now - self.policy.recent;
        let recent: Vec<AlertWindow> = windows.into_iter().filter(|w| w.end > cutoff).collect();

        let mut report = DispatchReport {
            windows: recent.len(),
            ..Default::default()
        };
        if recent.is_empty() {
            debug!("No alert windows in the recent period");
            return Ok(report);
        }

        // only the newest window of a key is considered, whatever its outcome
        let mut seen_this_tick: HashSet<(String, String)> = HashSet::new();
        for window in &recent {
            let key = (window.service.clone(), window.metric.clone());
            if !seen_this_tick.insert(key) {
                report.skipped_recent += 1;
                continue;
            }

            let last = match self
                .alerts
                .get_last_notified(&window.service, &window.metric)
                .await
            {
                Ok(last) => last,
                Err(e) => {
                    warn!(
                        service = %window.service,
                        metric = %window.metric,
                        error = %e,
                        "Failed to read notification state"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            if last.is_some_and(|last| now - last < self.policy.dedupe_interval) {
                debug!(
                    service = %window.service,
                    metric = %window.metric,
                    "Skipping alert, notified recently"
                );
                report.skipped_recent += 1;
                metrics::counter!("costwatch_notifications_total", "outcome" => "deduplicated")
                    .increment(1);
                continue;
            }

            let text = format_message(window, now, self.policy.bucket);
            if let Err(e) = self.notifier.send(&text).await {
                warn!(
                    service = %window.service,
                    metric = %window.metric,
                    error = %e,
                    "Failed to deliver alert"
                );
                report.failed += 1;
                metrics::counter!("costwatch_notifications_total", "outcome" => "failed")
                    .increment(1);
                continue;
            }

            report.posted += 1;
            metrics::counter!("costwatch_notifications_total", "outcome" => "posted").increment(1);

            if let Err(e) = self
                .alerts
                .set_last_notified(&window.service, &window.metric, now)
                .await
            {
                warn!(
                    service = %window.service,
                    metric = %window.metric,
                    error = %e,
                    "Alert sent but notification state not saved"
                );
            }
        }

        info!(
            windows = report.windows,
            posted = report.posted,
            skipped = report.skipped_recent,
            failed = report.failed,
            "Alert dispatch finished"
        );
        Ok(report)
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render the webhook text for a window
pub fn format_message(window: &AlertWindow, now: DateTime<Utc>, bucket: Duration) -> String {
    let head = format!(
        "[CostWatch] Alert: {}/{} exceeded threshold for {}h (expected ${:.2}, actual ${:.2})",
        window.service,
        window.metric,
        window.hours,
        window.expected_cost(),
        window.real_cost
    );
    if window.is_ongoing(now, bucket) {
        format!("{head} since {} UTC (ongoing)", rfc3339(window.start))
    } else {
        format!(
            "{head} from {} to {} UTC",
            rfc3339(window.start),
            rfc3339(window.end)
        )
    }
}
