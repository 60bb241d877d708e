//! Metrics replayed from JSON fixture files

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::collector::{Metric, Pricing};
use crate::error::{Error, Result};
use crate::models::Datapoint;

/// Service label used when a fixture does not name one
pub const DEFAULT_FIXTURE_SERVICE: &str = "fixture";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FixturePoint {
    timestamp: DateTime<Utc>,
    value: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FixtureFile {
    #[serde(default)]
    service: Option<String>,
    label: String,
    datapoints: Vec<FixturePoint>,
    price: f64,
    units_per_price: f64,
}

/// A metric whose datapoints come from a file loaded once at startup
#[derive(Debug, Clone)]
pub struct FixtureMetric {
    service: String,
    label: String,
    pricing: Pricing,
    points: Vec<Datapoint>,
}

impl FixtureMetric {
    /// Parse a fixture document:
    /// `{"Label", "Datapoints": [{"Timestamp", "Value"}], "Price", "UnitsPerPrice"}`
    /// with an optional `"Service"`.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: FixtureFile = serde_json::from_str(json)?;
        if file.label.is_empty() {
            return Err(Error::validation("fixture label must not be empty"));
        }

        let mut points: Vec<Datapoint> = file
            .datapoints
            .into_iter()
            .map(|p| Datapoint::new(p.timestamp, p.value))
            .collect();
        points.sort_by_key(|p| p.timestamp);

        Ok(Self {
            service: file
                .service
                .unwrap_or_else(|| DEFAULT_FIXTURE_SERVICE.to_string()),
            label: file.label,
            pricing: Pricing::new(file.price, file.units_per_price),
            points,
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
            .map_err(|e| Error::config(format!("fixture {}: {e}", path.display())))
    }

    /// Service the fixture belongs to
    pub fn service(&self) -> &str {
        &self.service
    }
}

#[async_trait]
impl Metric for FixtureMetric {
    fn label(&self) -> &str {
        &self.label
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }

    async fn datapoints(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Datapoint>> {
        Ok(self
            .points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp < end)
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = include_str!("../../fixtures/incoming_bytes.json");

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn parses_bundled_fixture() {
        let metric = FixtureMetric::from_json(SAMPLE).unwrap();
        assert_eq!(metric.service(), "aws.CloudWatch");
        assert_eq!(metric.label(), "IncomingBytes");
        assert_eq!(metric.pricing(), Pricing::new(50.0, 1e9));
        assert!(metric.points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn filters_half_open_range() {
        let metric = FixtureMetric::from_json(
            r#"{
                "Label": "m",
                "Datapoints": [
                    {"Timestamp": "2024-05-01T02:00:00Z", "Value": 2},
                    {"Timestamp": "2024-05-01T00:00:00Z", "Value": 0},
                    {"Timestamp": "2024-05-01T01:00:00Z", "Value": 1}
                ],
                "Price": 1,
                "UnitsPerPrice": 1
            }"#,
        )
        .unwrap();
        assert_eq!(metric.service(), DEFAULT_FIXTURE_SERVICE);

        let points = metric.datapoints(at(0), at(2)).await.unwrap();
        let values: Vec<_> = points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![0.0, 1.0]);
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(FixtureMetric::from_json(r#"{"Label": "m"}"#).is_err());
    }
}
