//! heimdall - quota-aware market-data CLI
//!
//! Inspect monthly API usage, fetch endpoints through the cache-first
//! dispatcher, and prune old cache entries.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use heimdall::config::{Config, Secrets};
use heimdall::{
    CacheStore, Decision, DispatcherBuilder, FileCacheStore, Params, QuotaGuard, UsageLedger,
    UsageMonth,
};

/// Heimdall CLI
#[derive(Parser)]
#[command(name = "heimdall")]
#[command(version = heimdall::PKG_VERSION)]
#[command(about = "Quota-governed, cache-first market-data client")]
struct Args {
    /// Config file (default: ~/.heimdall/config.toml, then /etc/heimdall/config.toml)
    #[arg(short, long, env = "HEIMDALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show this month's usage against the quota
    Usage {
        /// Number of recent requests to list
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },

    /// Fetch an endpoint and print the JSON payload
    Fetch {
        /// Endpoint path, e.g. "ios/ranking"
        endpoint: String,
        /// Query parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Cache TTL in hours (default: from config)
        #[arg(long)]
        ttl_hours: Option<u64>,
        /// Ignore any cached entry
        #[arg(long)]
        force: bool,
        /// Proceed past the hard quota threshold
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete cache entries older than the given age
    Prune {
        /// Age in days
        #[arg(long, default_value_t = 30)]
        days: u64,
    },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

/// Refuse to continue past the hard threshold unless `--yes` was given.
fn confirm(decision: &Decision, yes: bool) -> Result<(), String> {
    match decision {
        Decision::AllowWithWarning {
            usage,
            threshold,
            requires_confirmation: true,
        } if !yes => Err(format!(
            "monthly usage {usage} is past the hard threshold {threshold}; \
             re-run with --yes to fetch anyway"
        )),
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!(version = heimdall::version_string(), "heimdall starting");
    let config = Config::load(args.config.as_deref())?;

    match args.command {
        Command::Usage { recent } => {
            let ledger = UsageLedger::open(config.ledger_path()).await?;
            let guard = QuotaGuard::new(config.quota_policy()?);
            let month = UsageMonth::current();
            let snapshot = guard.snapshot(month, ledger.monthly_usage(month).await);
            let rule = "=".repeat(60);

            println!("{rule}");
            println!("API usage");
            println!("{rule}");
            println!("month:     {}", snapshot.month);
            println!("requests:  {}", snapshot.usage);
            println!("warn at:   {}", snapshot.policy.warn_threshold());
            println!("confirm:   {}", snapshot.policy.hard_threshold());
            println!("block at:  {}", snapshot.policy.block_threshold());
            println!("remaining: {}", snapshot.remaining);
            println!("status:    {}", snapshot.status);

            let records = ledger.recent(recent).await;
            if !records.is_empty() {
                println!("\n{rule}");
                println!("recent requests (last {}):", records.len());
                println!("{rule}");
                for record in records {
                    println!(
                        "{} | {:<17} | {}",
                        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        record.outcome,
                        record.endpoint
                    );
                }
            }

            println!("\n{rule}");
            println!("monthly history:");
            println!("{rule}");
            for (m, count) in ledger.monthly_history().await {
                let marker = if m == month { " <-" } else { "" };
                println!("{m}: {count:>5} requests{marker}");
            }
        }

        Command::Fetch {
            endpoint,
            params,
            ttl_hours,
            force,
            yes,
        } => {
            let secrets = Secrets::load()?;
            let dispatcher = DispatcherBuilder::from_config(&config, &secrets)?
                .build()
                .await?;

            let preflight = dispatcher.preflight(1).await;
            confirm(&preflight, yes)?;
            if preflight.requires_confirmation() {
                eprintln!("warning: monthly usage is past the hard threshold");
            }

            let ttl = ttl_hours
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                .unwrap_or(dispatcher.config().default_ttl);
            let params: Params = params.into_iter().collect();
            let payload = dispatcher.fetch(&endpoint, &params, ttl, force).await?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }

        Command::Prune { days } => {
            let cache = FileCacheStore::open(config.cache_dir())?;
            let removed = cache
                .prune(Duration::from_secs(days.saturating_mul(86_400)))
                .await?;
            println!("removed {removed} cache entries older than {days} days");
        }
    }

    Ok(())
}
