//! Command-line interface definitions for the market digest.
//!
//! Every option can also be supplied through an environment variable so the
//! binary can run unattended from a scheduler.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::Parser;

/// Command-line arguments for one digest run.
///
/// # Examples
///
/// ```sh
/// # Regular daily run
/// market_digest -c ./digest.yaml -o ./site
///
/// # Preview what today's sources would look like filed under another day
/// market_digest -c ./digest.yaml -o ./site --date 2025-05-06 --dry-run
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "DIGEST_CONFIG")]
    pub config: PathBuf,

    /// Directory holding index.json, latest.json and archive/
    #[arg(short, long, env = "DIGEST_OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Digest date (YYYY-MM-DD); defaults to today in the configured timezone.
    /// Sources are always fetched as of now, so outside --dry-run a past day
    /// is only accepted while it has no archive entry, and future days never.
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Fetch, normalize and classify, then print the document instead of archiving it
    #[arg(long)]
    pub dry_run: bool,
}
