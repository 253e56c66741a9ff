//! Sumi-Harvest main entry point
//!
//! This is the command-line interface for the Sumi-Harvest search harvester.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sumi_harvest::config::{load_config_with_hash, Config};
use sumi_harvest::crawler::{
    HtmlExtractor, HttpFetcher, Priority, SubmitOptions, TaskScheduler, TaskStore,
};
use sumi_harvest::output::{
    print_statistics, print_task_summary, spawn_notifier, LoggingNotifier, DEFAULT_EVENT_CAPACITY,
};
use sumi_harvest::TaskStatus;
use tracing_subscriber::EnvFilter;

/// Sumi-Harvest: a multi-site search harvester
///
/// Sumi-Harvest runs one keyword search against a set of configured sites,
/// follows the result links and extracts structured fields from each detail
/// page, while pacing requests, rotating proxies and backing off when a site
/// pushes back.
#[derive(Parser, Debug)]
#[command(name = "sumi-harvest")]
#[command(version = "1.0.0")]
#[command(about = "A multi-site search harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Search query
    #[arg(short = 'Q', long, required_unless_present = "dry_run")]
    query: Option<String>,

    /// Site id to search (repeatable; defaults to every configured site)
    #[arg(short, long = "site", value_name = "SITE_ID")]
    sites: Vec<String>,

    /// Overall task deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Stop after this many results
    #[arg(long)]
    max_results: Option<usize>,

    /// Attempts per request before giving up
    #[arg(long)]
    retry_attempts: Option<u32>,

    /// Task priority: low, normal or high
    #[arg(long, default_value = "normal", value_parser = parse_priority)]
    priority: Priority,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be searched without sending requests
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, _config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let site_ids: Vec<String> = if cli.sites.is_empty() {
        config.sites.iter().map(|s| s.id.clone()).collect()
    } else {
        cli.sites.clone()
    };

    if cli.dry_run {
        handle_dry_run(&config, &site_ids);
        return Ok(());
    }

    let query = cli.query.clone().unwrap_or_default();
    let options = SubmitOptions {
        max_results: cli.max_results,
        timeout: cli.timeout_ms.map(Duration::from_millis),
        retry_attempts: cli.retry_attempts,
        priority: cli.priority,
    };

    let status = handle_search(config, &query, &site_ids, options).await?;
    if status == TaskStatus::Failed {
        std::process::exit(1);
    }

    Ok(())
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    Priority::parse(value).ok_or_else(|| format!("unknown priority '{}'", value))
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_harvest=info,warn"),
            1 => EnvFilter::new("sumi_harvest=debug,info"),
            2 => EnvFilter::new("sumi_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Handles the --dry-run mode: shows what would be searched
fn handle_dry_run(config: &Config, site_ids: &[String]) {
    println!("=== Sumi-Harvest Dry Run ===\n");

    println!("Scheduler:");
    println!(
        "  Max concurrent tasks: {}",
        config.scheduler.max_concurrent_tasks
    );
    println!("  Max queue size: {}", config.scheduler.max_queue_size);
    println!("  Task timeout: {}ms", config.scheduler.task_timeout_ms);
    println!("  Default max results: {}", config.scheduler.default_max_results);
    println!(
        "  Default retry attempts: {}",
        config.scheduler.default_retry_attempts
    );

    println!("\nRate Limits:");
    println!(
        "  {}/s, {}/min, {}/h, burst {}",
        config.rate_limit.requests_per_second,
        config.rate_limit.requests_per_minute,
        config.rate_limit.requests_per_hour,
        config.rate_limit.burst_size
    );
    println!(
        "  Delay: {}ms base, {}ms max",
        config.rate_limit.base_delay_ms, config.rate_limit.max_delay_ms
    );

    println!("\nProxies ({}):", config.proxies.len());
    for proxy in &config.proxies {
        println!("  - {}", proxy.key());
    }

    println!("\nSites ({}):", site_ids.len());
    for id in site_ids {
        match config.site(id) {
            Some(site) => {
                println!("  - {} ({})", site.id, site.search_url);
                for (field, selector) in &site.fields {
                    println!("    * {} <- {}", field, selector);
                }
            }
            None => println!("  - {} (unknown site)", id),
        }
    }

    println!("\n✓ Configuration is valid");
}

/// Runs one search task to completion and prints its results
///
/// Results go to stdout as JSON lines; the summary and statistics follow.
/// Ctrl-C cancels the task, keeping whatever was collected.
async fn handle_search(
    config: Config,
    query: &str,
    site_ids: &[String],
    options: SubmitOptions,
) -> Result<TaskStatus, Box<dyn std::error::Error>> {
    let (events, dispatcher) = spawn_notifier(Arc::new(LoggingNotifier), DEFAULT_EVENT_CAPACITY);
    let fetcher = Arc::new(HttpFetcher::new(config.crawler.clone()));

    let scheduler = TaskScheduler::new(
        config,
        Arc::new(TaskStore::new()),
        fetcher,
        Arc::new(HtmlExtractor::new()),
        events,
    )?;

    let sites: Vec<&str> = site_ids.iter().map(String::as_str).collect();
    let task_id = scheduler.submit(query, &sites, options)?;

    let task = tokio::select! {
        task = scheduler.wait_for(&task_id) => task,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling task");
            scheduler.cancel(&task_id);
            scheduler.get_status(&task_id)
        }
    };

    let Some(task) = task else {
        return Err(format!("Task {} disappeared from the registry", task_id).into());
    };

    for result in &task.results {
        println!("{}", serde_json::to_string(result)?);
    }

    let stats = scheduler.stats();
    let proxies = scheduler.proxy_health();
    scheduler.shutdown();
    drop(scheduler);

    // Let queued events reach the log before exiting
    if tokio::time::timeout(Duration::from_secs(2), dispatcher)
        .await
        .is_err()
    {
        tracing::debug!("Event dispatcher still busy at exit");
    }

    println!();
    print_task_summary(&task);
    print_statistics(&stats, &proxies);

    Ok(task.status)
}
