//! Data models shared by every stage of the pipeline.
//!
//! This module defines the core data structures used throughout the application:
//! - [`Source`]: One configured feed or listing endpoint
//! - [`Record`]: The canonical content item produced by the feed decoder and
//!   enriched by extraction and sanitization
//! - [`SnapshotEntry`]: The flattened form handed to the renderer
//! - Cache entries: [`FeedCacheEntry`], [`ImageCacheEntry`], [`FullTextCacheEntry`]
//! - [`RunStats`]: Per-stage counters reported at the end of a run

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// A configured source endpoint.
///
/// # Fields
///
/// * `url` - Feed, listing page or WordPress JSON endpoint
/// * `name` - Origin name override; derived from the link when absent
/// * `category` - Category tag applied to every record from this source
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Source {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl Source {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            category: None,
        }
    }
}

/// One normalized content item.
///
/// Created with partial fields by the feed decoder, then mutated in place by
/// the orchestrator (origin and category normalization, timestamp clamping)
/// and by enrichment (content and image fields).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Record {
    /// Headline with markup stripped.
    pub title: String,
    /// Canonical absolute link; the deduplication key.
    pub link: String,
    /// Publish time. Records without one are dropped by the window filter.
    pub published: Option<DateTime<FixedOffset>>,
    /// The publish date exactly as the source wrote it.
    pub published_text: String,
    /// Origin identifier such as `rthk` or `hk01`.
    pub origin: String,
    pub category: String,
    /// Short summary text with markup stripped.
    pub summary: String,
    pub hero_image: Option<String>,
    pub images: Vec<String>,
    /// Sanitized article markup.
    pub content_html: String,
    /// Plain text of the article body.
    pub content_text: String,
    pub search_text: String,
}

/// A record as handed to the renderer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SnapshotEntry {
    pub title: String,
    pub link: String,
    /// Unix seconds.
    pub pub_ts: i64,
    /// `MM-DD HH:MM` in the reference timezone.
    pub pub_fmt: String,
    pub source: String,
    pub category: String,
    /// Local `images/<file>` path when localized, else the remote URL.
    pub hero_img: String,
    pub content: String,
    pub search_text: String,
}

/// Output of one run: the ordered entries plus the counters behind them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
    pub stats: RunStats,
}

/// Cached feed payload and its revalidation tokens.
///
/// The payload is stored base64-encoded so the on-disk JSON stays valid
/// whatever bytes the source served.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FeedCacheEntry {
    pub payload: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    pub timestamp: i64,
}

impl FeedCacheEntry {
    pub fn new(
        payload: &[u8],
        etag: Option<String>,
        last_modified: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            payload: STANDARD.encode(payload),
            etag,
            last_modified,
            timestamp,
        }
    }

    /// Decoded payload bytes, or `None` if the stored value is corrupt.
    pub fn payload_bytes(&self) -> Option<Vec<u8>> {
        STANDARD.decode(self.payload.as_bytes()).ok()
    }
}

/// A downloaded image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageCacheEntry {
    /// File name under the image directory.
    pub path: String,
    pub timestamp: i64,
    pub url: String,
}

/// Extraction result kept per record link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FullTextCacheEntry {
    pub content: String,
    #[serde(default)]
    pub hero_image: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub timestamp: i64,
}

/// Per-stage counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub sources: usize,
    pub fetched: usize,
    pub stale: usize,
    pub failed_sources: usize,
    pub decoded: usize,
    pub deduplicated: usize,
    pub windowed: usize,
    pub enriched: usize,
    pub cache_hits: usize,
    pub enrich_failures: usize,
}
