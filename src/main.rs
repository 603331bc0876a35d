//! Lurker main entry point
//!
//! This is the command-line interface for the Lurker ingestion pipeline.

use anyhow::Context;
use clap::Parser;
use lurker::config::{load_config_with_hash, Config};
use lurker::output::{load_summary, print_summary};
use lurker::storage::SqliteStorage;
use lurker::Orchestrator;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Lurker: a resumable fetch, extract and persist pipeline
///
/// Lurker fetches documents starting from seed addresses, extracts
/// structured entities with configurable selectors and stores them with
/// idempotent upserts. Interrupted jobs resume where they left off.
#[derive(Parser, Debug)]
#[command(name = "lurker")]
#[command(version)]
#[command(about = "A resumable fetch, extract and persist pipeline", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Additional seed address (repeatable)
    #[arg(long = "seed", value_name = "URL")]
    seeds: Vec<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would run without fetching anything
    #[arg(long, conflicts_with = "summary")]
    dry_run: bool,

    /// Print the summary of the existing database and exit
    #[arg(long, conflicts_with = "dry_run")]
    summary: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config, &cli.seeds);
    } else if cli.summary {
        handle_summary(&config)?;
    } else {
        handle_run(config, config_hash, cli.seeds).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("lurker=info,warn"),
            1 => EnvFilter::new("lurker=debug,info"),
            2 => EnvFilter::new("lurker=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode
fn handle_dry_run(config: &Config, extra_seeds: &[String]) {
    println!("=== Lurker Dry Run ===\n");

    println!("Pipeline:");
    println!("  Workers: {}", config.pipeline.workers);
    println!("  Requests per second: {}", config.pipeline.requests_per_second);
    println!("  Shutdown timeout: {}s", config.pipeline.shutdown_timeout_secs);

    println!("\nRetry:");
    println!("  Max attempts: {}", config.retry.max_attempts);
    println!(
        "  Backoff: {}ms x{} (max {}ms, jitter {}ms)",
        config.retry.base_delay_ms,
        config.retry.multiplier,
        config.retry.max_delay_ms,
        config.retry.jitter_ms
    );

    println!("\nCircuit breaker:");
    println!("  Failure threshold: {}", config.circuit_breaker.failure_threshold);
    println!("  Cooldown: {}ms", config.circuit_breaker.cooldown_ms);

    println!("\nStorage:");
    println!("  Database: {}", config.storage.database_path);
    match &config.storage.asset_dir {
        Some(dir) => println!("  Asset files: {}", dir),
        None => println!("  Asset files: not stored"),
    }
    println!("  Download images: {}", config.extract.assets);

    println!("\nScope:");
    println!("  Allow: {:?}", config.scope.allow);
    println!("  Deny: {:?}", config.scope.deny);

    println!("\nExtraction rules ({}):", config.extract.rules.len());
    for rule in &config.extract.rules {
        println!("  - {} <- {} (key: {})", rule.kind, rule.selector, rule.key);
    }

    let seeds: Vec<&String> = config.seeds.iter().chain(extra_seeds).collect();
    println!("\nSeeds ({}):", seeds.len());
    for seed in &seeds {
        println!("  * {}", seed);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --summary mode
fn handle_summary(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);

    let storage = SqliteStorage::new(Path::new(&config.storage.database_path))
        .context("failed to open database")?;
    let summary = load_summary(&storage, &storage)?;
    print_summary(&summary);

    Ok(())
}

/// Handles the main pipeline run
async fn handle_run(config: Config, config_hash: String, extra_seeds: Vec<String>) -> anyhow::Result<()> {
    let seeds: Vec<String> = config.seeds.iter().cloned().chain(extra_seeds).collect();

    let orchestrator = Orchestrator::open(config)
        .context("failed to start pipeline")?
        .with_config_hash(config_hash);
    orchestrator.seed(&seeds)?;

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight items");
            cancel.cancel();
        }
    });

    match orchestrator.run().await {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Pipeline failed: {}", e);
            Err(e.into())
        }
    }
}
