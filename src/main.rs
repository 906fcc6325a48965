//! # newsdesk
//!
//! A news ingestion pipeline that collects story summaries from syndication
//! feeds, HTML listing pages and WordPress JSON endpoints, pulls the full
//! article body and imagery for each story, and writes a deduplicated,
//! time-windowed snapshot for a static-site renderer.
//!
//! ## Features
//!
//! - RSS 2.0 and Atom (with a tolerant fallback for broken XML), WordPress
//!   REST post lists, and per-site listing scrapers for sources without feeds
//! - Conditional fetches with ETag / Last-Modified revalidation and stale
//!   payload fallback when a source is down
//! - Per-site extraction strategies for Hong Kong and technology news sites,
//!   with a generic fallback for everything else
//! - Site-aware sanitization and optional local copies of every image
//! - On-disk feed, image and full-text caches that make repeated runs cheap
//!
//! ## Usage
//!
//! ```sh
//! newsdesk -s feeds.yaml -c newsdesk.yaml -o site/snapshot.json
//! ```
//!
//! ## Architecture
//!
//! The application follows a pipeline architecture:
//! 1. **Fetching**: Conditionally download every source (bounded concurrency)
//! 2. **Decoding**: Turn each payload into normalized records
//! 3. **Selection**: Deduplicate by link, apply lookback windows and caps
//! 4. **Enrichment**: Extract and sanitize the full article for each record
//! 5. **Output**: Persist caches and write `snapshot.json`

use clap::Parser;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cache;
mod cli;
mod config;
mod error;
mod extract;
mod feeds;
mod fetch;
mod models;
mod origin;
mod outputs;
mod pipeline;
mod sanitize;
mod utils;

use cache::Caches;
use cli::Cli;
use config::{Config, load_sources};
use fetch::Fetcher;
use outputs::json;
use utils::ensure_writable_dir;

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
    info!("newsdesk starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(?args.sources, ?args.config, ?args.output, "Parsed CLI arguments");

    // ---- Configuration and sources ----
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_cli(&args)?;
    let sources = load_sources(&args.sources)?;
    info!(
        sources = sources.len(),
        concurrency = config.concurrency,
        lookback_hours = config.lookback_hours,
        max_items = config.max_items,
        localize_images = config.localize_images,
        "Configuration ready"
    );

    // Early check: every directory we write to must be writable
    let output_dir = config
        .output
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let mut writable = vec![output_dir, config.data_dir.clone()];
    if config.localize_images {
        writable.push(config.image_dir.clone());
    }
    for dir in &writable {
        let dir = dir.to_string_lossy();
        if let Err(e) = ensure_writable_dir(&dir).await {
            error!(
                path = %dir,
                error = %e,
                "Directory is not writable (fix perms or choose a different path)"
            );
            return Err(e.into());
        }
    }

    // ---- Build the snapshot ----
    let caches = Arc::new(Caches::load_from(&config.data_dir).await);
    let fetcher = Fetcher::new(&config, caches)?;
    let snapshot = pipeline::build_snapshot(&sources, &config, &fetcher).await?;

    if let Err(e) = json::write_snapshot(&snapshot.entries, &config.output).await {
        error!(path = %config.output.display(), error = %e, "Failed to write snapshot");
        return Err(e.into());
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        entries = snapshot.entries.len(),
        failed_sources = snapshot.stats.failed_sources,
        enrich_failures = snapshot.stats.enrich_failures,
        "Execution complete"
    );

    Ok(())
}
