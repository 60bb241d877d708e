//! # CostWatch
//!
//! Usage ingestion, cost tracking and threshold alerting for billable
//! services.
//!
//! CostWatch polls metered usage from external providers, stores it in a
//! columnar analytics store, prices it per bucket and raises alerts when a
//! service's hourly cost stays above its threshold.
//!
//! ## Architecture
//!
//! - **Collector**: incremental, restart-safe sync of every service/metric
//!   pair, driven by a fixed-interval scheduler
//! - **Storage**: ClickHouse for raw usage, SQLite for watermarks, rules and
//!   notification state
//! - **Alerting**: alert window detection and deduplicated webhook delivery
//! - **API**: REST API for cost views, alert windows and rule management
//!
//! ## Quick Start
//!
//! ```bash
//! # Scheduler and API in one process, everything in memory
//! costwatch --ephemeral serve
//!
//! # Inspect current alert windows
//! costwatch windows --hours 24
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod api;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod scheduler;
pub mod usage;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertRepository, AlertWindowEngine, NotificationDispatcher};
    pub use crate::collector::{Catalog, Collector, Metric, Registry, Service, SyncEngine};
    pub use crate::config::Config;
    pub use crate::db::{MetricsRepository, UsageSink, WatermarkStore};
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
}
