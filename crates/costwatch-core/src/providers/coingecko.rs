//! CoinGecko bitcoin price feed
//!
//! A demo metric: each hourly price point is treated as usage, billed at
//! 100 per unit.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::collector::{BillableService, Metric, Pricing};
use crate::config::CoinGeckoConfig;
use crate::error::{Error, Result};
use crate::models::{truncate, Datapoint};

/// Service label of the feed
pub const COINGECKO_SERVICE: &str = "coingecko";

const PRICE: f64 = 100.0;
const UNITS_PER_PRICE: f64 = 1.0;

#[derive(Debug, Default, Deserialize)]
pub struct MarketChart {
    #[serde(default)]
    pub prices: Vec<Vec<f64>>,
}

/// Bitcoin price in the configured currency
pub struct BitcoinPrice {
    client: Client,
    base_url: String,
    vs_currency: String,
    label: String,
}

impl BitcoinPrice {
    pub fn new(client: Client, config: &CoinGeckoConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            vs_currency: config.vs_currency.to_lowercase(),
            label: format!("btc_{}", config.vs_currency.to_lowercase()),
        }
    }

    /// Service wrapping this metric
    pub fn service(self) -> BillableService {
        BillableService::new(COINGECKO_SERVICE).with_metric(self)
    }

    async fn market_chart(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<MarketChart> {
        let days = (end - start).num_seconds() as f64 / 86_400.0;
        let days = days.ceil() as i64;
        if days <= 0 {
            return Ok(MarketChart::default());
        }

        let url = format!("{}/coins/bitcoin/market_chart", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("vs_currency", self.vs_currency.clone()),
                ("days", days.to_string()),
            ])
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::provider(format!(
                "coingecko returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Metric for BitcoinPrice {
    fn label(&self) -> &str {
        &self.label
    }

    fn pricing(&self) -> Pricing {
        Pricing::new(PRICE, UNITS_PER_PRICE)
    }

    async fn datapoints(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Datapoint>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let chart = self.market_chart(start, end).await?;
        let points = prices_to_datapoints(&chart, start, end, Duration::hours(1));
        debug!(metric = %self.label, points = points.len(), "Fetched market chart");
        Ok(points)
    }
}

/// Convert `[millis, price]` pairs into one datapoint per bucket.
///
/// Timestamps are truncated to the bucket, the first price seen for a bucket
/// wins, and only buckets in `[start, end)` are kept.
pub fn prices_to_datapoints(
    chart: &MarketChart,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    bucket: Duration,
) -> Vec<Datapoint> {
    let mut points: Vec<Datapoint> = Vec::with_capacity(chart.prices.len());
    for pair in &chart.prices {
        let &[ms, price] = pair.as_slice() else {
            continue;
        };
        let Some(ts) = DateTime::from_timestamp_millis(ms as i64) else {
            continue;
        };
        let ts = truncate(ts, bucket);
        if ts < start || ts >= end {
            continue;
        }
        if points.iter().any(|p| p.timestamp == ts) {
            continue;
        }
        points.push(Datapoint::new(ts, price));
    }
    points
}
