//! Billable services and the metrics they expose

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::Datapoint;

use super::cost::{Catalog, Pricing};

/// A metered quantity of a billable service
#[async_trait]
pub trait Metric: Send + Sync {
    /// Label, unique within the owning service
    fn label(&self) -> &str;

    /// Pricing applied to the metric's units
    fn pricing(&self) -> Pricing;

    /// Datapoints with `start <= timestamp < end`
    async fn datapoints(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<Vec<Datapoint>>;
}

/// A billable service owning one or more metrics
pub trait Service: Send + Sync {
    /// Globally unique label
    fn label(&self) -> &str;

    fn metrics(&self) -> &[Arc<dyn Metric>];
}

/// A service assembled from a label and a list of metrics
pub struct BillableService {
    label: String,
    metrics: Vec<Arc<dyn Metric>>,
}

impl BillableService {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            metrics: Vec::new(),
        }
    }

    pub fn with_metric(mut self, metric: impl Metric + 'static) -> Self {
        self.metrics.push(Arc::new(metric));
        self
    }
}

impl Service for BillableService {
    fn label(&self) -> &str {
        &self.label
    }

    fn metrics(&self) -> &[Arc<dyn Metric>] {
        &self.metrics
    }
}

/// All registered services, built once at startup
///
/// Iteration order is stable: services by label, metrics in the order the
/// service lists them.
#[derive(Default)]
pub struct Registry {
    services: BTreeMap<String, Arc<dyn Service>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; labels must be unique
    pub fn register(&mut self, service: impl Service + 'static) -> Result<()> {
        let label = service.label().to_string();
        if label.is_empty() {
            return Err(Error::validation("service label must not be empty"));
        }
        if self.services.contains_key(&label) {
            return Err(Error::validation(format!(
                "service {label} is already registered"
            )));
        }

        let metrics = service.metrics();
        for (i, metric) in metrics.iter().enumerate() {
            if metrics[..i].iter().any(|m| m.label() == metric.label()) {
                return Err(Error::validation(format!(
                    "metric {} is registered twice for service {label}",
                    metric.label()
                )));
            }
        }

        self.services.insert(label, Arc::new(service));
        Ok(())
    }

    pub fn service(&self, label: &str) -> Option<&Arc<dyn Service>> {
        self.services.get(label)
    }

    pub fn metric(&self, service: &str, metric: &str) -> Option<&Arc<dyn Metric>> {
        self.service(service)?
            .metrics()
            .iter()
            .find(|m| m.label() == metric)
    }

    /// Every `(service label, metric)` pair in sync order
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &Arc<dyn Metric>)> {
        self.services
            .iter()
            .flat_map(|(label, svc)| svc.metrics().iter().map(move |m| (label.as_str(), m)))
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}

impl Catalog for Registry {
    fn compute_cost(&self, service: &str, metric: &str, units: f64) -> Option<f64> {
        self.metric(service, metric)?.pricing().cost(units)
    }
}
