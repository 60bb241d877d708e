//! Configuration management for CostWatch
//!
//! Values are layered: built-in defaults, then an optional config file, then
//! `COSTWATCH_*` environment variables (`__` separates sections, e.g.
//! `COSTWATCH_SYNC__INTERVAL=30s`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerting::StaticRuleRepository;
use crate::error::{Error, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Relational state store (watermarks, rules, notification state)
    pub state: StateConfig,

    /// Columnar analytics store holding raw usage
    pub analytics: AnalyticsConfig,

    /// Sync engine configuration
    pub sync: SyncConfig,

    /// Alerting configuration
    pub alerting: AlertingConfig,

    /// Usage providers
    pub providers: ProvidersConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional file plus the environment.
    ///
    /// A `.env` file in the working directory is read first; variables that
    /// are already set are not overridden.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("COSTWATCH")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("analytics.exclude_services")
                .with_list_parse_key("providers.fixtures")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler or window engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("sync.interval", self.sync.interval),
            ("sync.backfill", self.sync.backfill),
            ("sync.call_timeout", self.sync.call_timeout),
            ("alerting.bucket", self.alerting.bucket),
            ("alerting.lookback", self.alerting.lookback),
            ("alerting.webhook_timeout", self.alerting.webhook_timeout),
        ];
        for (key, value) in non_zero {
            if value.is_zero() {
                return Err(Error::config(format!("{key} must be greater than zero")));
            }
        }

        if self.alerting.lookback < self.alerting.bucket {
            return Err(Error::config("alerting.lookback must cover at least one bucket"));
        }

        if let Some(rules) = &self.alerting.rules_json {
            StaticRuleRepository::from_json(rules)
                .map_err(|e| Error::config(format!("alerting.rules_json: {e}")))?;
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// HTTP API port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4001,
        }
    }
}

impl ServerConfig {
    /// `host:port` listen address
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// State store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".db/costwatch.db"),
        }
    }
}

/// Analytics store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// ClickHouse HTTP endpoint
    pub url: String,
    /// Database holding the `metrics` table
    pub database: String,
    /// User name
    pub user: String,
    /// Password
    pub password: Option<String>,
    /// Services hidden from aggregation queries (e.g. demo feeds)
    pub exclude_services: Vec<String>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "costwatch".to_string(),
            user: "default".to_string(),
            password: None,
            exclude_services: Vec::new(),
        }
    }
}

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between scheduler ticks
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Lookback used when a pair has never been synced
    #[serde(with = "humantime_serde")]
    pub backfill: Duration,
    /// Minimum history re-fetched on every tick for late datapoints
    #[serde(with = "humantime_serde")]
    pub refetch_slack: Duration,
    /// Upper bound for any single provider or storage call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            backfill: Duration::from_secs(48 * 3600),
            refetch_slack: Duration::from_secs(15 * 60),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Webhook receiving alert messages; alerts are dropped silently when unset
    pub webhook_url: Option<String>,
    /// Static JSON rule set, e.g.
    /// `[{"service":"aws.CloudWatch","metric":"IncomingBytes","threshold":0.47}]`.
    /// When set, rules are read-only.
    pub rules_json: Option<String>,
    /// Bucket width rules are evaluated against
    #[serde(with = "humantime_serde")]
    pub bucket: Duration,
    /// History scanned for windows on each tick
    #[serde(with = "humantime_serde")]
    pub lookback: Duration,
    /// Only windows ending within this span are notified
    #[serde(with = "humantime_serde")]
    pub recent: Duration,
    /// Minimum time between notifications for one service/metric
    #[serde(with = "humantime_serde")]
    pub dedupe_interval: Duration,
    /// Webhook request timeout
    #[serde(with = "humantime_serde")]
    pub webhook_timeout: Duration,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            rules_json: None,
            bucket: Duration::from_secs(3600),
            lookback: Duration::from_secs(48 * 3600),
            recent: Duration::from_secs(2 * 3600),
            dedupe_interval: Duration::from_secs(3600),
            webhook_timeout: Duration::from_secs(10),
        }
    }
}

/// Usage provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// CoinGecko price feed
    pub coingecko: CoinGeckoConfig,
    /// AWS CloudWatch (requires the `aws` feature)
    pub cloudwatch: CloudWatchConfig,
    /// JSON fixture files replayed as metrics
    pub fixtures: Vec<PathBuf>,
}

/// CoinGecko configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoinGeckoConfig {
    pub enabled: bool,
    pub base_url: String,
    pub vs_currency: String,
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            vs_currency: "eur".to_string(),
        }
    }
}

/// CloudWatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudWatchConfig {
    pub enabled: bool,
    pub namespace: String,
    /// Statistic period in seconds
    pub period_secs: i32,
}

impl Default for CloudWatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "AWS/Logs".to_string(),
            period_secs: 900,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
