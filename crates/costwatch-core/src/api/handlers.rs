//! API handlers for the HTTP REST API

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::alerting::{AlertRepository, AlertWindowEngine};
use crate::error::{self, Error};
use crate::models::{AlertRule, PercentileCost, QueryResult, UsageItem};
use crate::usage::{UsageService, DEFAULT_INTERVAL_SECS, DEFAULT_PERCENTILE_DAYS, DEFAULT_USAGE_DAYS};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub usage: UsageService,
    pub alerts: Arc<dyn AlertRepository>,
    pub windows: AlertWindowEngine,
    /// Bucket width of alert windows
    pub bucket: Duration,
    /// Present when the Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn error_response(e: Error) -> (StatusCode, String) {
    let status = match &e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::ReadOnly(_) => StatusCode::CONFLICT,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    }
    (status, e.to_string())
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus exposition of the self-monitoring counters
pub async fn prometheus_metrics(
    State(state): State<AppState>,
) -> Result<String, (StatusCode, String)> {
    state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .ok_or((
            StatusCode::NOT_FOUND,
            "metrics recorder not installed".to_string(),
        ))
}

/// Time range query shared by the read endpoints
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Bucket width in seconds
    pub interval: Option<i64>,
}

impl RangeQuery {
    fn resolve(
        &self,
        default_days: i64,
    ) -> error::Result<(DateTime<Utc>, DateTime<Utc>, Duration)> {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = match self.from {
            Some(from) => from,
            None => Duration::try_days(default_days)
                .and_then(|span| to.checked_sub_signed(span))
                .ok_or_else(|| Error::validation("`to` is too early for the default range"))?,
        };
        let secs = self.interval.unwrap_or(DEFAULT_INTERVAL_SECS);
        let interval = Duration::try_seconds(secs)
            .ok_or_else(|| Error::validation(format!("interval out of range: {secs}")))?;
        Ok((from, to, interval))
    }
}

/// Cost per bucket
pub async fn get_usage(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<QueryResult<UsageItem>> {
    let (from, to, interval) = query.resolve(DEFAULT_USAGE_DAYS).map_err(error_response)?;
    let result = state
        .usage
        .usage(from, to, interval)
        .await
        .map_err(error_response)?;
    Ok(Json(result))
}

/// Cost percentiles per service/metric
pub async fn get_usage_percentiles(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<QueryResult<PercentileCost>> {
    let (from, to, interval) = query
        .resolve(DEFAULT_PERCENTILE_DAYS)
        .map_err(error_response)?;
    let result = state
        .usage
        .percentiles(from, to, interval)
        .await
        .map_err(error_response)?;
    Ok(Json(result))
}

/// List alert rules response
#[derive(Debug, Serialize, Deserialize)]
pub struct AlertRulesResponse {
    pub items: Vec<AlertRule>,
}

pub async fn list_alert_rules(State(state): State<AppState>) -> ApiResult<AlertRulesResponse> {
    let items = state.alerts.list_rules().await.map_err(error_response)?;
    Ok(Json(AlertRulesResponse { items }))
}

/// Create or replace the rule for a service/metric
pub async fn upsert_alert_rule(
    State(state): State<AppState>,
    Json(rule): Json<AlertRule>,
) -> ApiResult<AlertRule> {
    rule.validate().map_err(error_response)?;
    state
        .alerts
        .upsert_rule(&rule)
        .await
        .map_err(error_response)?;

    info!(
        service = %rule.service,
        metric = %rule.metric,
        threshold = rule.threshold,
        "Alert rule updated"
    );
    Ok(Json(rule))
}

/// Alert window as rendered by the API
#[derive(Debug, Serialize, Deserialize)]
pub struct AlertWindowItem {
    pub service: String,
    pub metric: String,
    pub start: DateTime<Utc>,
    /// `None` while the window runs up to the end of the queried range
    pub end: Option<DateTime<Utc>>,
    pub ongoing: bool,
    pub hours: u32,
    pub expected_cost: f64,
    pub real_cost: f64,
    pub threshold: f64,
}

/// Alert windows, most recent first. Never sends notifications.
pub async fn list_alert_windows(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<QueryResult<AlertWindowItem>> {
    let (from, to, _) = query.resolve(DEFAULT_USAGE_DAYS).map_err(error_response)?;
    if from >= to {
        return Err(error_response(Error::validation("`from` must be before `to`")));
    }

    let windows = state
        .windows
        .compute_windows(from, to, state.bucket)
        .await
        .map_err(error_response)?;

    // buckets past now hold no data yet
    let range_end = to.min(Utc::now());
    let items = windows
        .into_iter()
        .map(|w| {
            let ongoing = w.is_ongoing(range_end, state.bucket);
            AlertWindowItem {
                expected_cost: w.expected_cost(),
                end: (!ongoing).then_some(w.end),
                ongoing,
                service: w.service,
                metric: w.metric,
                start: w.start,
                hours: w.hours,
                real_cost: w.real_cost,
                threshold: w.threshold,
            }
        })
        .collect();

    Ok(Json(QueryResult {
        from_date: from,
        to_date: to,
        interval: state.bucket.num_seconds(),
        items,
    }))
}
