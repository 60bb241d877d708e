//! CostWatch CLI
//!
//! Command-line interface for the CostWatch usage and cost alerting service.

use std::process::ExitCode;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use costwatch::collector::{Collector, RunMode};
use costwatch::models::AlertRule;
use costwatch::Config;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// CostWatch - usage ingestion and cost alerting for billable services
#[derive(Parser)]
#[command(name = "costwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "COSTWATCH_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Keep all state in memory; no ClickHouse or SQLite
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Output format (for commands that print data)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync scheduler and the HTTP API
    Serve,

    /// Run the sync scheduler only
    Worker,

    /// Run the HTTP API only
    Api,

    /// Run a single sync tick and exit
    Sync,

    /// Manage alert rules
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },

    /// Print current alert windows without notifying
    Windows {
        /// Hours of history to scan
        #[arg(long, default_value = "48")]
        hours: i64,
    },
}

#[derive(Subcommand)]
enum RulesCommands {
    /// List all alert rules
    List,

    /// Create or replace the rule for a service/metric
    Set {
        #[arg(long)]
        service: String,

        #[arg(long)]
        metric: String,

        /// Cost per bucket above which an alert window opens
        #[arg(long)]
        threshold: f64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    let result = run(cli, config).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// RUST_LOG wins over the configured level
fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_metrics_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve => run_service(config, cli.ephemeral, RunMode::All).await,
        Commands::Worker => run_service(config, cli.ephemeral, RunMode::Worker).await,
        Commands::Api => run_service(config, cli.ephemeral, RunMode::Api).await,
        Commands::Sync => run_sync(config, cli.ephemeral).await,
        Commands::Rules { command } => run_rules(config, cli.ephemeral, command, cli.format).await,
        Commands::Windows { hours } => run_windows(config, cli.ephemeral, hours, cli.format).await,
    }
}

async fn run_service(config: Config, ephemeral: bool, mode: RunMode) -> anyhow::Result<()> {
    let metrics = install_metrics_recorder();
    let collector = Collector::new(config, ephemeral)
        .await
        .context("failed to start collector")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down...");
            }
            cancel.cancel();
        });
    }

    collector.start(mode, metrics, cancel).await?;
    Ok(())
}

async fn run_sync(config: Config, ephemeral: bool) -> anyhow::Result<()> {
    let collector = Collector::new(config, ephemeral).await?;
    let report = collector
        .sync_engine()?
        .sync(Utc::now(), &CancellationToken::new())
        .await;

    println!(
        "synced {} pair(s), {} skipped, {} failed, {} datapoint(s)",
        report.synced, report.skipped, report.failed, report.datapoints
    );
    if report.failed > 0 {
        anyhow::bail!("{} pair(s) failed to sync", report.failed);
    }
    Ok(())
}

async fn run_rules(
    config: Config,
    ephemeral: bool,
    command: RulesCommands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let collector = Collector::new(config, ephemeral).await?;
    let alerts = collector.alerts();

    match command {
        RulesCommands::List => {
            let rules = alerts.list_rules().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rules)?),
                OutputFormat::Text => {
                    if rules.is_empty() {
                        println!("No alert rules configured");
                    }
                    for rule in rules {
                        println!("{}/{}  threshold {:.2}", rule.service, rule.metric, rule.threshold);
                    }
                }
            }
        }
        RulesCommands::Set {
            service,
            metric,
            threshold,
        } => {
            let rule = AlertRule::new(service, metric, threshold);
            rule.validate()?;
            alerts.upsert_rule(&rule).await?;
            println!("Saved rule {}/{} threshold {:.2}", rule.service, rule.metric, rule.threshold);
        }
    }
    Ok(())
}

/// Start of the `windows --hours` scan ending at `now`
fn scan_start(now: DateTime<Utc>, hours: i64) -> anyhow::Result<DateTime<Utc>> {
    if hours <= 0 {
        anyhow::bail!("--hours must be positive");
    }
    Duration::try_hours(hours)
        .and_then(|span| now.checked_sub_signed(span))
        .with_context(|| format!("--hours is out of range: {hours}"))
}

async fn run_windows(
    config: Config,
    ephemeral: bool,
    hours: i64,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let from = scan_start(now, hours)?;
    let bucket = Duration::from_std(config.alerting.bucket)?;
    let collector = Collector::new(config, ephemeral).await?;

    let windows = collector
        .windows()
        .compute_windows(from, now, bucket)
        .await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&windows)?),
        OutputFormat::Text => {
            if windows.is_empty() {
                println!("No alert windows in the last {hours}h");
            }
            for window in &windows {
                println!(
                    "{}",
                    costwatch::alerting::format_message(window, now, bucket)
                );
            }
        }
    }
    Ok(())
}
