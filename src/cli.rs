//! Command-line interface definitions for newsdesk.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Every flag except `--sources` overrides a value from the optional YAML
//! configuration file, and most can also be given as environment variables.

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for a snapshot run.
///
/// # Examples
///
/// ```sh
/// # Basic usage with the default configuration
/// newsdesk --sources feeds.yaml
///
/// # Custom config, narrower window, no image downloads
/// newsdesk -s feeds.yaml -c newsdesk.yaml --lookback-hours 3 --no-localize
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Source list (JSON or YAML)
    #[arg(short, long, env = "NEWSDESK_SOURCES")]
    pub sources: PathBuf,

    /// Optional path to a YAML configuration file
    #[arg(short, long, env = "NEWSDESK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Where to write snapshot.json
    #[arg(short, long, env = "NEWSDESK_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Directory holding the feed, image and full-text caches
    #[arg(long, env = "NEWSDESK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory localized images are written to
    #[arg(long, env = "NEWSDESK_IMAGE_DIR")]
    pub image_dir: Option<PathBuf>,

    /// Maximum simultaneous network operations
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Common lookback window in hours
    #[arg(long)]
    pub lookback_hours: Option<f64>,

    /// Maximum number of entries in the snapshot
    #[arg(long)]
    pub max_items: Option<usize>,

    /// Keep remote image URLs instead of downloading them
    #[arg(long)]
    pub no_localize: bool,
}
