//! Alert data models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A per-bucket cost threshold for one service/metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub service: String,
    pub metric: String,
    /// Cost per bucket above which the bucket counts as exceeding
    pub threshold: f64,
}

impl AlertRule {
    pub fn new(service: impl Into<String>, metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            service: service.into(),
            metric: metric.into(),
            threshold,
        }
    }

    /// Check labels and threshold before the rule is stored
    pub fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            return Err(Error::validation("service must not be empty"));
        }
        if self.metric.trim().is_empty() {
            return Err(Error::validation("metric must not be empty"));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(Error::validation(format!(
                "threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// A maximal run of contiguous buckets whose cost exceeded the rule threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertWindow {
    pub service: String,
    pub metric: String,
    /// Start of the first exceeding bucket
    pub start: DateTime<Utc>,
    /// End of the last exceeding bucket (its start plus one bucket)
    pub end: DateTime<Utc>,
    /// Number of buckets in the window
    pub hours: u32,
    /// Summed cost of all buckets in the window
    pub real_cost: f64,
    pub threshold: f64,
}

impl AlertWindow {
    /// Cost the window would have had at exactly the threshold
    pub fn expected_cost(&self) -> f64 {
        self.threshold * f64::from(self.hours)
    }

    /// A window is ongoing when its last bucket is the one containing the
    /// instant just before `range_end`, i.e. the window runs up to the end of
    /// the observed range.
    pub fn is_ongoing(&self, range_end: DateTime<Utc>, bucket: Duration) -> bool {
        let last = range_end
            .checked_sub_signed(Duration::nanoseconds(1))
            .unwrap_or(range_end);
        self.end > super::truncate(last, bucket)
    }
}
