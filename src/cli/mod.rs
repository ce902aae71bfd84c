//! Command-line interface for palisade.
//!
//! Provides commands for checking dependency health, inspecting usage
//! against limits, managing webhook deliveries and the dead-letter queue,
//! and running the dispatch worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::config::{self, ResolvedConfig};
use crate::core::circuit::CircuitBreaker;
use crate::core::ledger::{Period, UsageLedger};
use crate::domain::DependencyName;
use crate::health::{HealthAggregator, HealthProbe, HttpProbe};
use crate::webhook::{DeliveryStore, HttpSender, WebhookDispatcher};

/// palisade - Resilient external-call orchestration
#[derive(Parser, Debug)]
#[command(name = "palisade")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe configured dependencies and print the aggregated report
    Health,

    /// Show usage against limits for an identity
    Usage {
        /// API key or tenant identifier
        identity: String,

        /// Reporting period
        #[arg(short, long, value_enum, default_value = "day")]
        period: PeriodArg,
    },

    /// Inspect webhook deliveries
    Deliveries {
        #[command(subcommand)]
        command: DeliveryCommands,
    },

    /// Manage the webhook dead-letter queue
    Deadletters {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },

    /// Run the webhook dispatch worker
    Dispatch {
        /// Process what is currently due, then exit
        #[arg(long)]
        once: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum DeliveryCommands {
    /// Queue-level delivery counts
    Stats,

    /// Show one delivery
    Status {
        /// Delivery ID (UUID)
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum DeadLetterCommands {
    /// List dead-lettered deliveries
    List,

    /// Re-enqueue a dead-letter with a fresh attempt budget
    Replay {
        /// Delivery ID (UUID)
        id: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum PeriodArg {
    Day,
    Month,
}

impl From<PeriodArg> for Period {
    fn from(arg: PeriodArg) -> Self {
        match arg {
            PeriodArg::Day => Period::Day,
            PeriodArg::Month => Period::Month,
        }
    }
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Health => show_health().await,
            Commands::Usage { identity, period } => show_usage(&identity, period.into()).await,
            Commands::Deliveries { command } => match command {
                DeliveryCommands::Stats => show_delivery_stats().await,
                DeliveryCommands::Status { id } => show_delivery(&id).await,
            },
            Commands::Deadletters { command } => match command {
                DeadLetterCommands::List => list_dead_letters().await,
                DeadLetterCommands::Replay { id } => replay_dead_letter(&id).await,
            },
            Commands::Dispatch { once } => dispatch(once).await,
            Commands::Config => show_config(),
        }
    }
}

fn parse_delivery_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid delivery ID: {}", id))
}

async fn open_store(config: &ResolvedConfig) -> Result<DeliveryStore> {
    DeliveryStore::open(config.deliveries_path())
        .await
        .context("Failed to open delivery log")
}

async fn show_health() -> Result<()> {
    let config = config::config()?;

    let mut probes: Vec<Arc<dyn HealthProbe>> = Vec::new();
    for dep in &config.dependencies {
        if let Some(url) = &dep.health_url {
            let probe = HttpProbe::new(
                DependencyName::from(dep.name.as_str()),
                url.clone(),
                Duration::from_secs(config.health.probe_timeout_seconds),
            )
            .context("Failed to build health probe HTTP client")?;
            probes.push(Arc::new(probe));
        }
    }

    if probes.is_empty() {
        println!("No dependencies with health endpoints configured.");
        return Ok(());
    }

    let circuits = Arc::new(CircuitBreaker::new(config.circuit));
    let aggregator = HealthAggregator::new(probes, circuits, config.health.clone());
    let report = aggregator.check().await;

    println!("Overall: {}  ({} ms)", report.overall, report.duration_ms);
    println!();
    for (name, snapshot) in &report.dependencies {
        let latency = snapshot
            .latency_ms
            .map(|ms| format!("{} ms", ms))
            .unwrap_or_else(|| "-".to_string());
        print!("  {:<20} {:<10} {:>8}", name, snapshot.status, latency);
        if let Some(error) = &snapshot.error {
            print!("  {}", error);
        }
        println!();
    }

    Ok(())
}

async fn show_usage(identity: &str, period: Period) -> Result<()> {
    let config = config::config()?;
    let ledger = UsageLedger::open(config.usage_journal_path(), config.limits)
        .await
        .context("Failed to open usage journal")?;

    let summary = ledger.report(identity, period).await;

    println!("Identity: {}", summary.identity);
    println!("Period:   {}", summary.period_key);
    println!();
    println!(
        "  Requests: {:>10} / {:<10}  ({} remaining)",
        summary.requests, summary.limits.requests, summary.remaining_requests
    );
    println!(
        "  Units:    {:>10} / {:<10}  ({} remaining)",
        summary.units, summary.limits.units, summary.remaining_units
    );
    println!(
        "  Cost:     {:>10.4} / {:<10.2}  (${:.4} remaining)",
        summary.cost_usd, summary.limits.cost_usd, summary.remaining_cost_usd
    );

    Ok(())
}

async fn show_delivery_stats() -> Result<()> {
    let config = config::config()?;
    let store = open_store(config).await?;
    let stats = store.stats().await?;

    println!("Pending:       {}", stats.pending);
    println!("Delivered:     {}", stats.delivered);
    println!("Dead-lettered: {}", stats.dead_lettered);
    println!("Total:         {}", stats.total());

    Ok(())
}

async fn show_delivery(id: &str) -> Result<()> {
    let config = config::config()?;
    let store = open_store(config).await?;
    let id = parse_delivery_id(id)?;

    match store.get(id).await? {
        Some(delivery) => {
            println!("{}", serde_json::to_string_pretty(&delivery)?);
            Ok(())
        }
        None => anyhow::bail!("Delivery not found: {}", id),
    }
}

async fn list_dead_letters() -> Result<()> {
    let config = config::config()?;
    let store = open_store(config).await?;
    let dead = store.dead_letters().await?;

    if dead.is_empty() {
        println!("Dead-letter queue is empty.");
        return Ok(());
    }

    for delivery in dead {
        println!(
            "{}  {}  attempts={}  {}",
            delivery.id,
            delivery.event_type,
            delivery.attempts,
            delivery.last_error.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

async fn replay_dead_letter(id: &str) -> Result<()> {
    let config = config::config()?;
    let store = open_store(config).await?;
    let id = parse_delivery_id(id)?;

    store
        .replay_dead_letter(id)
        .await
        .context("Failed to replay delivery")?;
    println!("Delivery {} re-enqueued.", id);

    Ok(())
}

async fn dispatch(once: bool) -> Result<()> {
    let config = config::config()?;
    let store = Arc::new(open_store(config).await?);
    let circuits = Arc::new(CircuitBreaker::new(config.circuit));
    let sender = Arc::new(
        HttpSender::new(Duration::from_secs(
            config.retry.webhook.attempt_timeout_seconds,
        ))
        .context("Failed to build webhook HTTP client")?,
    );
    let dispatcher =
        WebhookDispatcher::new(store, sender, circuits, config.webhook.clone());

    if once {
        let processed = dispatcher.tick().await?;
        println!("Processed {} deliveries.", processed);
        Ok(())
    } else {
        dispatcher.run().await?;
        Ok(())
    }
}

fn show_config() -> Result<()> {
    let config = config::config()?;

    println!("Home:         {}", config.home.display());
    match &config.config_file {
        Some(path) => println!("Config file:  {}", path.display()),
        None => println!("Config file:  (none, using defaults)"),
    }
    println!("Usage journal: {}", config.usage_journal_path().display());
    println!("Delivery log:  {}", config.deliveries_path().display());
    println!();
    println!(
        "Circuit:  threshold={} recovery={}s",
        config.circuit.failure_threshold, config.circuit.recovery_timeout_seconds
    );
    println!(
        "Limits:   daily {}req/{}u/${}  monthly {}req/{}u/${}",
        config.limits.daily.requests,
        config.limits.daily.units,
        config.limits.daily.cost_usd,
        config.limits.monthly.requests,
        config.limits.monthly.units,
        config.limits.monthly.cost_usd
    );
    println!(
        "Webhook:  max_attempts={} poll={}s signing={}",
        config.webhook.max_attempts,
        config.webhook.poll_interval_seconds,
        if config.webhook.secret.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("Dependencies:");
    for dep in &config.dependencies {
        println!(
            "  {:<20} {}",
            dep.name,
            dep.health_url.as_deref().unwrap_or("(no health endpoint)")
        );
    }

    Ok(())
}
