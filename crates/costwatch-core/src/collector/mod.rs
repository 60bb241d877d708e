//! Collector module - usage ingestion and process wiring
//!
//! The collector owns the service registry and the storage adapters, builds
//! the sync engine and alerting pipeline on top of them, and runs the
//! scheduler and HTTP API.

mod cost;
mod registry;
mod sync;

pub use cost::{round_cents, Catalog, Pricing};
pub use registry::{BillableService, Metric, Registry, Service};
pub use sync::{fetch_range, SyncEngine, SyncPolicy, SyncReport};

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alerting::{
    chrono_duration, AlertRepository, AlertWindowEngine, DispatchPolicy, NotificationDispatcher,
    StaticRuleRepository, WebhookNotifier,
};
use crate::api::{AppState, HttpServer};
use crate::config::Config;
use crate::db::{
    ClickHouseStore, MemoryAlertRepository, MemoryMetricsStore, MemoryWatermarks,
    MetricsRepository, SqliteStateStore, UsageSink, WatermarkStore,
};
use crate::error::Result;
use crate::providers::build_registry;
use crate::scheduler::Scheduler;
use crate::usage::UsageService;

/// Which long-running parts of the process to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Scheduler and HTTP API
    All,
    /// Scheduler only
    Worker,
    /// HTTP API only
    Api,
}

impl RunMode {
    fn runs_scheduler(self) -> bool {
        matches!(self, Self::All | Self::Worker)
    }

    fn runs_api(self) -> bool {
        matches!(self, Self::All | Self::Api)
    }
}

/// The main collector service
pub struct Collector {
    config: Config,
    registry: Arc<Registry>,
    metrics: Arc<dyn MetricsRepository>,
    sink: Arc<dyn UsageSink>,
    watermarks: Arc<dyn WatermarkStore>,
    alerts: Arc<dyn AlertRepository>,
}

impl Collector {
    /// Create a new collector instance.
    ///
    /// With `ephemeral` set, every store lives in process memory and nothing
    /// external is contacted apart from the usage providers.
    pub async fn new(config: Config, ephemeral: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.sync.call_timeout)
            .user_agent(concat!("costwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let registry = Arc::new(build_registry(&config.providers, http).await?);

        let static_rules = config
            .alerting
            .rules_json
            .as_deref()
            .map(StaticRuleRepository::from_json)
            .transpose()?;

        let metrics: Arc<dyn MetricsRepository>;
        let sink: Arc<dyn UsageSink>;
        let watermarks: Arc<dyn WatermarkStore>;
        let alerts: Arc<dyn AlertRepository>;
        if ephemeral {
            info!("Running with in-memory stores, nothing will be persisted");
            let store = Arc::new(
                MemoryMetricsStore::new()
                    .with_excluded_services(config.analytics.exclude_services.clone()),
            );
            metrics = store.clone();
            sink = store;
            watermarks = Arc::new(MemoryWatermarks::new());
            alerts = match static_rules {
                Some(rules) => Arc::new(rules),
                None => Arc::new(MemoryAlertRepository::new()),
            };
        } else {
            let analytics = Arc::new(ClickHouseStore::connect(&config.analytics).await?);
            analytics.health_check().await?;
            let state = Arc::new(SqliteStateStore::open(&config.state.path).await?);
            state.health_check().await?;
            metrics = analytics.clone();
            sink = analytics;
            watermarks = state.clone();
            alerts = match static_rules {
                Some(rules) => Arc::new(rules),
                None => state,
            };
        }

        Ok(Self {
            config,
            registry,
            metrics,
            sink,
            watermarks,
            alerts,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn alerts(&self) -> &Arc<dyn AlertRepository> {
        &self.alerts
    }

    /// Read-only window computation, priced by the registry
    pub fn windows(&self) -> AlertWindowEngine {
        AlertWindowEngine::new(
            self.metrics.clone(),
            self.alerts.clone(),
            self.registry.clone(),
        )
    }

    /// Sync engine with alert dispatch as its post-step
    pub fn sync_engine(&self) -> Result<SyncEngine> {
        let notifier = WebhookNotifier::new(
            self.config.alerting.webhook_url.clone(),
            self.config.alerting.webhook_timeout,
        )?;
        if !notifier.is_configured() {
            info!("No webhook configured, alerts will only be logged");
        }

        let dispatcher = NotificationDispatcher::new(
            self.windows(),
            self.alerts.clone(),
            Arc::new(notifier),
            DispatchPolicy::from_config(&self.config.alerting)?,
        );

        Ok(SyncEngine::new(
            self.registry.clone(),
            self.watermarks.clone(),
            self.sink.clone(),
            SyncPolicy::from_config(&self.config.sync)?,
        )
        .with_dispatcher(Arc::new(dispatcher)))
    }

    /// State for the HTTP API
    pub fn app_state(&self, metrics: Option<PrometheusHandle>) -> Result<AppState> {
        Ok(AppState {
            usage: UsageService::new(self.metrics.clone(), self.registry.clone()),
            alerts: self.alerts.clone(),
            windows: self.windows(),
            bucket: chrono_duration(self.config.alerting.bucket)?,
            metrics,
        })
    }

    /// Run until `cancel` fires
    pub async fn start(
        &self,
        mode: RunMode,
        metrics: Option<PrometheusHandle>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(?mode, pairs = self.registry.pairs().count(), "Starting CostWatch");

        let scheduler = if mode.runs_scheduler() {
            let engine = Arc::new(self.sync_engine()?);
            let scheduler = Arc::new(Scheduler::new(self.config.sync.interval, engine));
            Some(scheduler.spawn(cancel.clone()))
        } else {
            None
        };

        let server = if mode.runs_api() {
            let addr = self.config.server.addr();
            let server = HttpServer::new(self.app_state(metrics)?);
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server.serve(&addr, cancel.clone()).await {
                    error!(error = %e, "HTTP server error");
                    cancel.cancel();
                }
            }))
        } else {
            None
        };

        cancel.cancelled().await;
        info!("Shutdown signal received");

        for handle in [scheduler, server].into_iter().flatten() {
            if let Err(e) = handle.await {
                error!(error = %e, "Task ended abnormally");
            }
        }

        info!("Collector stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlertRule;
    use chrono::Utc;
    use std::io::Write;

    fn fixture_config(rules_json: Option<&str>) -> (Config, tempfile::NamedTempFile) {
        let mut fixture = tempfile::NamedTempFile::new().unwrap();
        fixture
            .write_all(include_bytes!("../../fixtures/incoming_bytes.json"))
            .unwrap();

        let mut config = Config::default();
        config.providers.fixtures = vec![fixture.path().into()];
        config.alerting.rules_json = rules_json.map(str::to_string);
        (config, fixture)
    }

    #[tokio::test]
    async fn ephemeral_collector_syncs_fixtures() {
        let (config, _fixture) = fixture_config(None);
        let collector = Collector::new(config, true).await.unwrap();
        assert_eq!(collector.registry().len(), 1);

        // the fixture covers 2024-05-01; backfill from a day later reaches it
        let now = "2024-05-02T06:00:00Z".parse().unwrap();
        let report = collector
            .sync_engine()
            .unwrap()
            .sync(now, &CancellationToken::new())
            .await;

        assert_eq!(report.synced, 1);
        assert_eq!(report.datapoints, 48);
    }

    #[tokio::test]
    async fn ephemeral_rules_are_writable() {
        let (config, _fixture) = fixture_config(None);
        let collector = Collector::new(config, true).await.unwrap();

        collector
            .alerts()
            .upsert_rule(&AlertRule::new("aws.CloudWatch", "IncomingBytes", 1.0))
            .await
            .unwrap();
        assert_eq!(collector.alerts().list_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rules_json_selects_static_rules() {
        let (config, _fixture) = fixture_config(Some(
            r#"[{"service": "aws.CloudWatch", "metric": "IncomingBytes", "threshold": 0.47}]"#,
        ));
        let collector = Collector::new(config, true).await.unwrap();

        let err = collector
            .alerts()
            .upsert_rule(&AlertRule::new("aws.CloudWatch", "IncomingBytes", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::ReadOnly(_)));

        let windows = collector
            .windows()
            .compute_windows(
                Utc::now() - chrono::Duration::hours(1),
                Utc::now(),
                chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert!(windows.is_empty());
    }

    #[tokio::test]
    async fn start_stops_on_cancel() {
        let (mut config, _fixture) = fixture_config(None);
        config.server.port = 0;
        config.server.host = "127.0.0.1".into();
        let collector = Collector::new(config, true).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        collector.start(RunMode::All, None, cancel).await.unwrap();
    }
}
