use anyhow::Result;
use clap::Parser;
use geocrawl::config::{duration_from_secs, CrawlConfig, HARD_MAX_CALLS};
use geocrawl::places::GooglePlacesClient;
use geocrawl::runner::{dry_run_report, ensure_db_guard, CrawlRunner, RunnerOptions};
use geocrawl::store::CrawlStore;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "geocrawl")]
#[command(about = "Adaptive geo-grid ingestion crawler for place discovery")]
struct Args {
    /// Target SQLite store path
    #[arg(long, default_value = "data/places_trial.db")]
    db_path: PathBuf,

    /// Allow writes to the protected production store (blocked by default)
    #[arg(long)]
    allow_prod_db: bool,

    /// Path to the crawl config file (YAML or JSON)
    #[arg(long, default_value = "crawl_config.yaml")]
    config: PathBuf,

    /// Requested API call cap; clamped to the hard ceiling of 4000
    #[arg(long)]
    max_calls: Option<i64>,

    /// Resume the latest unfinished run instead of starting a new one
    #[arg(long)]
    resume: bool,

    /// Print planned regions/cells and call estimates without hitting the API
    #[arg(long)]
    dry_run: bool,

    /// HTTP timeout for search requests, in seconds
    #[arg(long, default_value_t = 12.0)]
    request_timeout_sec: f64,

    /// Delay between API requests, in seconds
    #[arg(long, default_value_t = 0.1)]
    request_delay_sec: f64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let effective_max_calls = args
        .max_calls
        .map(|v| v.min(HARD_MAX_CALLS))
        .unwrap_or(HARD_MAX_CALLS);
    anyhow::ensure!(effective_max_calls > 0, "--max-calls must be > 0");

    let request_timeout = duration_from_secs(args.request_timeout_sec, "--request-timeout-sec")?;
    anyhow::ensure!(!request_timeout.is_zero(), "--request-timeout-sec must be > 0");
    let request_delay = duration_from_secs(args.request_delay_sec, "--request-delay-sec")?;

    ensure_db_guard(&args.db_path, args.allow_prod_db)?;
    let config = CrawlConfig::load(&args.config)?;

    if args.dry_run {
        print!("{}", dry_run_report(&config, effective_max_calls));
        return Ok(());
    }

    let api_key = std::env::var("GOOGLE_PLACES_API_KEY")
        .map_err(|_| anyhow::anyhow!("missing GOOGLE_PLACES_API_KEY environment variable"))?;

    if let Some(parent) = args.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = CrawlStore::open(&args.db_path)?;
    let client = GooglePlacesClient::new(api_key, request_timeout)?;
    let options = RunnerOptions {
        db_path: args.db_path.clone(),
        config_path: args.config.clone(),
        max_calls: effective_max_calls,
        allow_prod_db: args.allow_prod_db,
        resume: args.resume,
        request_delay,
    };

    info!("Starting crawl against {}", args.db_path.display());
    let runner = CrawlRunner::new(store, client, config, options);

    // Budget exhaustion is a successful bounded outcome, same as completion;
    // both exit 0. Loop failures have already marked the run failed.
    let summary = runner.run().await?;
    println!("{}", summary);
    Ok(())
}
