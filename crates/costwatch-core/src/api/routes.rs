//! API routes

use axum::{routing::get, Router};

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))

        // Usage
        .route("/v1/costwatch/usage", get(handlers::get_usage))
        .route(
            "/v1/costwatch/usage-percentiles",
            get(handlers::get_usage_percentiles),
        )

        // Alerts
        .route(
            "/v1/costwatch/alert-rules",
            get(handlers::list_alert_rules).put(handlers::upsert_alert_rule),
        )
        .route("/v1/costwatch/alert-windows", get(handlers::list_alert_windows))

        .with_state(state)
}
