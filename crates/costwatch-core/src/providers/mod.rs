//! Usage providers
//!
//! Each provider implements [`Metric`](crate::collector::Metric) for one
//! external source. [`build_registry`] turns the `providers` config section
//! into the registry the sync engine walks.

mod coingecko;
#[cfg(feature = "aws")]
mod cloudwatch;
mod fixture;

#[cfg(feature = "aws")]
pub use cloudwatch::{IncomingBytes, CLOUDWATCH_SERVICE};
pub use coingecko::{prices_to_datapoints, BitcoinPrice, MarketChart, COINGECKO_SERVICE};
pub use fixture::{FixtureMetric, DEFAULT_FIXTURE_SERVICE};

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::collector::{BillableService, Registry};
use crate::config::ProvidersConfig;
use crate::error::Result;

/// Build the service registry from configuration.
///
/// Fixture files naming the same service are grouped under one service.
pub async fn build_registry(config: &ProvidersConfig, http: reqwest::Client) -> Result<Registry> {
    let mut registry = Registry::new();

    if config.coingecko.enabled {
        registry.register(BitcoinPrice::new(http, &config.coingecko).service())?;
    }

    if config.cloudwatch.enabled {
        #[cfg(feature = "aws")]
        registry.register(IncomingBytes::from_env(&config.cloudwatch).await.service())?;
        #[cfg(not(feature = "aws"))]
        warn!("CloudWatch provider enabled but built without the `aws` feature, skipping");
    }

    let mut fixtures: BTreeMap<String, BillableService> = BTreeMap::new();
    for path in &config.fixtures {
        let metric = FixtureMetric::load(path).await?;
        let service = metric.service().to_string();
        let entry = fixtures
            .remove(&service)
            .unwrap_or_else(|| BillableService::new(service.clone()));
        fixtures.insert(service, entry.with_metric(metric));
    }
    for (_, service) in fixtures {
        registry.register(service)?;
    }

    if registry.is_empty() {
        warn!("No usage providers configured, sync will be a no-op");
    } else {
        info!(services = registry.len(), "Usage providers registered");
    }
    Ok(registry)
}
