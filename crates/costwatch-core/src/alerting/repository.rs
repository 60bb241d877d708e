//! Alert rule storage

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::AlertRule;

/// Alert rules plus the per service/metric notification state
#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn list_rules(&self) -> Result<Vec<AlertRule>>;

    /// Insert or replace the rule for `(service, metric)`
    async fn upsert_rule(&self, rule: &AlertRule) -> Result<()>;

    async fn get_last_notified(&self, service: &str, metric: &str)
        -> Result<Option<DateTime<Utc>>>;

    async fn set_last_notified(&self, service: &str, metric: &str, at: DateTime<Utc>)
        -> Result<()>;
}

#[derive(Deserialize)]
struct RuleEntry {
    service: String,
    metric: String,
    threshold: f64,
}

/// Rules fixed at startup from a JSON document
///
/// Writes fail with [`Error::ReadOnly`]. Notification state lives in process
/// memory only and starts empty after a restart.
#[derive(Debug, Clone, Default)]
pub struct StaticRuleRepository {
    rules: Vec<AlertRule>,
    notified: Arc<RwLock<HashMap<(String, String), DateTime<Utc>>>>,
}

impl StaticRuleRepository {
    /// Parse `[{"service": .., "metric": .., "threshold": ..}, ..]`
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<RuleEntry> = serde_json::from_str(json)?;
        let mut rules: Vec<AlertRule> = Vec::with_capacity(entries.len());
        for entry in entries {
            let rule = AlertRule::new(entry.service, entry.metric, entry.threshold);
            rule.validate()?;
            // later entries win, like an upsert
            rules.retain(|r| r.service != rule.service || r.metric != rule.metric);
            rules.push(rule);
        }
        rules.sort_by(|a, b| (&a.service, &a.metric).cmp(&(&b.service, &b.metric)));
        Ok(Self {
            rules,
            notified: Arc::default(),
        })
    }
}

#[async_trait]
impl AlertRepository for StaticRuleRepository {
    async fn list_rules(&self) -> Result<Vec<AlertRule>> {
        Ok(self.rules.clone())
    }

    async fn upsert_rule(&self, _rule: &AlertRule) -> Result<()> {
        Err(Error::ReadOnly("static alert rule set"))
    }

    async fn get_last_notified(&self, service: &str, metric: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .notified
            .read()
            .get(&(service.to_string(), metric.to_string()))
            .copied())
    }

    async fn set_last_notified(&self, service: &str, metric: &str, at: DateTime<Utc>) -> Result<()> {
        self.notified
            .write()
            .insert((service.to_string(), metric.to_string()), at);
        Ok(())
    }
}
