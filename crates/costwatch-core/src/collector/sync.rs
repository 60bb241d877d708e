//! Incremental usage sync
//!
//! Each tick walks every registered service/metric pair, fetches usage since
//! the pair's watermark, writes it as one batch and only then advances the
//! watermark. A failing pair is logged and retried on the next tick without
//! affecting the others.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerting::{chrono_duration, NotificationDispatcher};
use crate::config::SyncConfig;
use crate::db::{UsageSink, WatermarkStore};
use crate::error::Result;
use crate::models::UsageRecord;
use crate::scheduler::{bounded, Job};

use super::registry::{Metric, Registry};

/// Range and timeout settings for the sync engine
#[derive(Debug, Clone, Copy)]
pub struct SyncPolicy {
    /// Lookback for pairs that were never synced
    pub backfill: Duration,
    /// History always re-fetched to pick up late datapoints
    pub refetch_slack: Duration,
    /// Bound for every provider and storage call
    pub call_timeout: std::time::Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            backfill: Duration::hours(48),
            refetch_slack: Duration::minutes(15),
            call_timeout: std::time::Duration::from_secs(60),
        }
    }
}

impl SyncPolicy {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            backfill: chrono_duration(config.backfill)?,
            refetch_slack: chrono_duration(config.refetch_slack)?,
            call_timeout: config.call_timeout,
        })
    }
}

/// The `[start, end)` range to fetch for a pair, or `None` when there is
/// nothing to fetch.
///
/// A missing or epoch watermark backfills. Otherwise the range starts at the
/// watermark, pulled back so at least `refetch_slack` is always re-read.
pub fn fetch_range(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &SyncPolicy,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = match last {
        Some(last) if last > DateTime::<Utc>::UNIX_EPOCH => last.min(now - policy.refetch_slack),
        _ => now - policy.backfill,
    };
    let end = now;
    (start < end).then_some((start, end))
}

/// Outcome of one sync tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    pub datapoints: usize,
}

/// Fetches usage for every registered pair and records progress
pub struct SyncEngine {
    registry: Arc<Registry>,
    watermarks: Arc<dyn WatermarkStore>,
    sink: Arc<dyn UsageSink>,
    policy: SyncPolicy,
    dispatcher: Option<Arc<NotificationDispatcher>>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<Registry>,
        watermarks: Arc<dyn WatermarkStore>,
        sink: Arc<dyn UsageSink>,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            registry,
            watermarks,
            sink,
            policy,
            dispatcher: None,
        }
    }

    /// Run alert dispatch after every sync
    pub fn with_dispatcher(mut self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub async fn sync(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> SyncReport {
        let mut report = SyncReport::default();

        for (service, metric) in self.registry.pairs() {
            if cancel.is_cancelled() {
                info!("Sync cancelled, leaving remaining pairs for the next tick");
                break;
            }

            match self.sync_pair(service, metric.as_ref(), now, cancel).await {
                Ok(Some(count)) => {
                    report.synced += 1;
                    report.datapoints += count;
                    metrics::counter!("costwatch_sync_pairs_total", "outcome" => "synced")
                        .increment(1);
                    metrics::counter!("costwatch_datapoints_ingested_total")
                        .increment(count as u64);
                }
                Ok(None) => {
                    report.skipped += 1;
                    metrics::counter!("costwatch_sync_pairs_total", "outcome" => "skipped")
                        .increment(1);
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!("costwatch_sync_pairs_total", "outcome" => "failed")
                        .increment(1);
                    error!(
                        service = %service,
                        metric = %metric.label(),
                        error = %e,
                        transient = e.is_transient(),
                        "Sync failed, watermark left unchanged"
                    );
                }
            }
        }

        info!(
            synced = report.synced,
            skipped = report.skipped,
            failed = report.failed,
            datapoints = report.datapoints,
            "Sync finished"
        );

        if let Some(dispatcher) = &self.dispatcher {
            if !cancel.is_cancelled() {
                let res = bounded(
                    "alert dispatch",
                    self.policy.call_timeout,
                    cancel,
                    dispatcher.dispatch(now),
                )
                .await;
                if let Err(e) = res {
                    warn!(error = %e, "Alert dispatch failed");
                }
            }
        }

        report
    }

    /// Sync one pair; `Ok(None)` when its range is empty
    async fn sync_pair(
        &self,
        service: &str,
        metric: &dyn Metric,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        let timeout = self.policy.call_timeout;
        let label = metric.label();

        let last = bounded(
            "watermark read",
            timeout,
            cancel,
            self.watermarks.get(service, label),
        )
        .await?;

        let Some((start, end)) = fetch_range(last, now, &self.policy) else {
            debug!(service = %service, metric = %label, "Nothing to fetch");
            return Ok(None);
        };

        debug!(service = %service, metric = %label, start = %start, end = %end, "Fetching usage");
        let points = bounded("provider fetch", timeout, cancel, metric.datapoints(start, end)).await?;

        let records: Vec<UsageRecord> = points
            .into_iter()
            .map(|p| UsageRecord::new(service, label, p))
            .collect();
        if !records.is_empty() {
            bounded("usage write", timeout, cancel, self.sink.write_batch(&records)).await?;
        }

        // never hand the store an older instant than it already holds
        let commit = last.map_or(end, |last| last.max(end));
        bounded(
            "watermark write",
            timeout,
            cancel,
            self.watermarks.set(service, label, commit),
        )
        .await?;

        Ok(Some(records.len()))
    }
}

#[async_trait]
impl Job for SyncEngine {
    fn name(&self) -> &'static str {
        "sync"
    }

    async fn run(&self, now: DateTime<Utc>, cancel: &CancellationToken) {
        self.sync(now, cancel).await;
    }
}
