//! Cost calculation for metered usage
//!
//! Every metric is billed at `price` per `units_per_price` units. Costs are
//! rounded to cents exactly once, on the final product.

/// Price of a metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    /// Price charged per `units_per_price` units
    pub price: f64,
    /// Number of units covered by one `price`
    pub units_per_price: f64,
}

impl Pricing {
    pub fn new(price: f64, units_per_price: f64) -> Self {
        Self {
            price,
            units_per_price,
        }
    }

    /// Cost of `units`, or `None` when it cannot be computed
    pub fn cost(&self, units: f64) -> Option<f64> {
        if self.units_per_price == 0.0 {
            return None;
        }
        let cost = round_cents(units / self.units_per_price * self.price);
        cost.is_finite().then_some(cost)
    }
}

/// Round to two decimals, halves away from zero
pub fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Maps `(service, metric, units)` to a cost
pub trait Catalog: Send + Sync {
    /// `None` when the metric is unknown or its pricing is unusable
    fn compute_cost(&self, service: &str, metric: &str, units: f64) -> Option<f64>;
}
