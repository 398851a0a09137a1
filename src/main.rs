//! # Market Digest
//!
//! A daily digest pipeline for crypto and stock market news. It collects
//! weather, index quotes, crypto prices and news headlines, has an
//! OpenAI-compatible LLM categorize and summarize the headlines, and files
//! the result as one JSON document per day in a date-ordered archive.
//!
//! ## Usage
//!
//! ```sh
//! LLM_API_KEY=... market_digest -c ./digest.yaml -o ./site
//! ```
//!
//! ## Architecture
//!
//! The application follows a pipeline architecture:
//! 1. **Fetching**: every source is queried concurrently; a failing source
//!    becomes a gap in the document, never an aborted run
//! 2. **Normalizing**: records are validated, deduplicated and split into
//!    domestic and international news
//! 3. **Classifying**: one LLM call assigns categories, per-item digests, a
//!    market summary and a price-impact note
//! 4. **Archiving**: the document is merged into `index.json` and written
//!    under `archive/`, with rollback if any write fails

use std::error::Error;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod archive;
mod classifier;
mod cli;
mod config;
mod error;
mod fetchers;
mod models;
mod normalizer;
mod pipeline;
mod utils;

use api::{ChatClient, RetryAsk};
use archive::ArchiveStore;
use cli::Cli;
use config::Config;
use error::RunError;
use pipeline::RunOptions;

/// Initial delay between LLM attempts when retries are enabled.
const LLM_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("market_digest starting up");

    let args = Cli::parse();
    debug!(config = %args.config.display(), output_dir = %args.output_dir.display(), date = ?args.date, dry_run = args.dry_run, "Parsed CLI arguments");

    if let Err(e) = run(&args).await {
        error!(error = %e, "Run failed");
        return Err(e.into());
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    Ok(())
}

async fn run(args: &Cli) -> Result<(), RunError> {
    let config = Config::load(&args.config)?;

    let now = Utc::now();
    let date = args.date.unwrap_or_else(|| config.today(now));
    info!(%date, "Building digest");

    let client = fetchers::build_client(&config.fetch).map_err(RunError::Client)?;
    let llm = RetryAsk::new(
        ChatClient::from_env(&config.llm)?,
        config.llm.max_retries,
        LLM_RETRY_BASE_DELAY,
    );
    let store = ArchiveStore::new(&args.output_dir);

    let (doc, summary) = pipeline::run(
        &config,
        &client,
        &llm,
        &store,
        RunOptions {
            date,
            now,
            dry_run: args.dry_run,
        },
    )
    .await?;

    if args.dry_run {
        let json = serde_json::to_string_pretty(&doc).map_err(error::PersistenceError::from)?;
        println!("{json}");
    } else {
        info!(
            root = %store.root().display(),
            date = %summary.date,
            news = summary.news_count,
            entries = ?summary.archive_entries,
            "Archive updated"
        );
    }
    if !summary.failed_sources.is_empty() {
        info!(failed = ?summary.failed_sources, "Digest published with missing sources");
    }
    Ok(())
}
