//! Snapshot orchestration.
//!
//! A run moves every source through the same stages:
//!
//! 1. **Fetch**: conditional fetch of each source, decoded on a blocking worker
//! 2. **Normalize**: origin names, categories, timestamps in the reference zone
//! 3. **Dedupe**: by canonical link, first occurrence wins
//! 4. **Window**: per-origin retention rules, then the common lookback
//! 5. **Enrich**: full-text cache or page fetch, extraction, sanitization
//! 6. **Assemble**: hero localization and [`SnapshotEntry`] construction
//!
//! Concurrent stages use ordered buffering, so the result depends only on the
//! source order and the payloads, never on which request finished first.
//! Network calls are additionally bounded by the [`Fetcher`]'s limiter.

use chrono::{DateTime, FixedOffset, Utc};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, RetentionRule, hours};
use crate::error::Result;
use crate::extract::extract;
use crate::feeds::{self, DecodeContext};
use crate::fetch::{FetchSource, Fetched, Fetcher};
use crate::models::{FullTextCacheEntry, Record, RunStats, Snapshot, SnapshotEntry, Source};
use crate::origin::Origin;
use crate::sanitize::{LOCAL_PREFIX, Sanitizer};
use crate::utils::{
    collapse_whitespace, host_label, strip_markup, truncate_chars, truncate_for_log,
};

/// Characters kept in [`SnapshotEntry::search_text`].
const SEARCH_TEXT_LIMIT: usize = 1000;

/// Payload bytes kept for the log line of an undecodable source.
const PREVIEW_BYTES: usize = 1024;

/// Display format of [`SnapshotEntry::pub_fmt`].
const PUB_FORMAT: &str = "%m-%d %H:%M";

/// Build the ordered snapshot for `sources`.
///
/// Fetches every source, selects the records inside the lookback window,
/// enriches them with their full article, and persists the caches. Per-source
/// and per-record failures only show up in [`RunStats`].
///
/// # Arguments
///
/// * `sources` - Feed, listing and WordPress sources to collect
/// * `config` - Run configuration (window, caps, localization, data directory)
/// * `fetcher` - Shared HTTP front end carrying the caches
///
/// # Returns
///
/// The [`Snapshot`]: entries newest first, plus the run counters.
///
/// # Errors
///
/// Returns an error only when the caches cannot be persisted.
pub async fn build_snapshot(
    sources: &[Source],
    config: &Config,
    fetcher: &Fetcher,
) -> Result<Snapshot> {
    let now = Utc::now().with_timezone(&config.tz());
    build_snapshot_at(sources, config, fetcher, now).await
}

/// [`build_snapshot`] with an explicit "now".
///
/// # Arguments
///
/// * `now` - Reference time for the lookback window and cache expiry
#[instrument(level = "info", skip_all, fields(sources = sources.len(), now = %now))]
pub async fn build_snapshot_at(
    sources: &[Source],
    config: &Config,
    fetcher: &Fetcher,
    now: DateTime<FixedOffset>,
) -> Result<Snapshot> {
    let mut stats = RunStats {
        sources: sources.len(),
        ..RunStats::default()
    };

    let records = fetch_all(sources, config, fetcher, now, &mut stats).await;
    stats.decoded = records.len();

    let records = records
        .into_iter()
        .map(|record| normalize(record, config, now))
        .unique_by(|record| record.link.clone())
        .collect_vec();
    stats.deduplicated = records.len();

    let records = window(records, config, now);
    stats.windowed = records.len();
    info!(
        decoded = stats.decoded,
        deduplicated = stats.deduplicated,
        windowed = stats.windowed,
        "Selected records"
    );

    let records = enrich_all(records, config, fetcher, now, &mut stats).await;
    let entries = assemble(records, config, fetcher).await;

    let cutoff = now - hours(config.cache_gc_days * 24.0);
    fetcher
        .caches()
        .persist_to(&config.data_dir, cutoff.timestamp())
        .await?;

    info!(
        sources = stats.sources,
        fetched = stats.fetched,
        stale = stats.stale,
        failed_sources = stats.failed_sources,
        decoded = stats.decoded,
        deduplicated = stats.deduplicated,
        windowed = stats.windowed,
        enriched = stats.enriched,
        cache_hits = stats.cache_hits,
        enrich_failures = stats.enrich_failures,
        entries = entries.len(),
        "Snapshot built"
    );
    Ok(Snapshot { entries, stats })
}

/// What fetching one source produced.
struct SourceOutcome {
    via: FetchSource,
    decoded: bool,
    records: Vec<Record>,
}

#[instrument(level = "info", skip_all)]
async fn fetch_all(
    sources: &[Source],
    config: &Config,
    fetcher: &Fetcher,
    now: DateTime<FixedOffset>,
    stats: &mut RunStats,
) -> Vec<Record> {
    let outcomes: Vec<SourceOutcome> = stream::iter(sources)
        .map(|source| fetch_source(source, config, fetcher, now))
        .buffered(config.concurrency)
        .collect()
        .await;

    let mut records = Vec::new();
    for outcome in outcomes {
        match outcome.via {
            FetchSource::Failed => stats.failed_sources += 1,
            FetchSource::Stale => {
                stats.fetched += 1;
                stats.stale += 1;
            }
            FetchSource::Network | FetchSource::NotModified => stats.fetched += 1,
        }
        if outcome.via != FetchSource::Failed && !outcome.decoded {
            stats.failed_sources += 1;
        }
        records.extend(outcome.records);
    }
    info!(
        fetched = stats.fetched,
        stale = stats.stale,
        failed = stats.failed_sources,
        records = records.len(),
        "Fetched sources"
    );
    records
}

async fn fetch_source(
    source: &Source,
    config: &Config,
    fetcher: &Fetcher,
    now: DateTime<FixedOffset>,
) -> SourceOutcome {
    let fetched = fetcher.fetch(&source.url).await;
    let via = fetched.meta.source;
    if fetched.is_empty() {
        warn!(url = %source.url, status = ?fetched.meta.status, "Source returned nothing");
        return SourceOutcome {
            via: FetchSource::Failed,
            decoded: false,
            records: Vec::new(),
        };
    }

    let ctx = DecodeContext {
        source_url: source.url.clone(),
        origin: source.name.clone().unwrap_or_default(),
        category: source.category.clone().unwrap_or_default(),
        now,
        tz: config.tz(),
    };
    let Fetched { payload, meta } = fetched;
    debug!(
        url = %source.url,
        status = ?meta.status,
        etag = ?meta.etag,
        last_modified = ?meta.last_modified,
        bytes = payload.len(),
        "Source payload ready"
    );
    let preview = String::from_utf8_lossy(&payload[..payload.len().min(PREVIEW_BYTES)]).into_owned();
    match tokio::task::spawn_blocking(move || feeds::decode(&payload, &ctx)).await {
        Ok(Ok(records)) => {
            debug!(url = %source.url, ?via, records = records.len(), "Decoded source");
            SourceOutcome {
                via,
                decoded: true,
                records,
            }
        }
        Ok(Err(e)) => {
            warn!(
                url = %source.url,
                error = %e,
                preview = %truncate_for_log(&preview, 200),
                "Could not decode source"
            );
            SourceOutcome {
                via,
                decoded: false,
                records: Vec::new(),
            }
        }
        Err(e) => {
            warn!(url = %source.url, error = %e, "Decode worker failed");
            SourceOutcome {
                via,
                decoded: false,
                records: Vec::new(),
            }
        }
    }
}

/// Names a configured source gave that are really URLs, or nothing at all.
fn is_placeholder_origin(name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name.contains("://") || name.contains('/') || name.contains('.')
}

/// Registry name of the link's origin, or its host label for unknown sites.
fn origin_name(link: &str) -> String {
    match Origin::from_url(link) {
        Origin::Generic => host_label(link).unwrap_or_else(|| Origin::Generic.name().to_string()),
        origin => origin.name().to_string(),
    }
}

/// Category from well-known path segments of the link.
pub fn infer_category(link: &str) -> &'static str {
    let lowered = link.to_ascii_lowercase();
    let segments = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect_vec();
    let has = |words: &[&str]| segments.iter().any(|s| words.contains(s));

    if has(&["ent", "entertainment"]) {
        "ent"
    } else if has(&["tech", "technology"])
        || matches!(
            Origin::from_url(link),
            Origin::Unwire | Origin::Hkepc | Origin::NineToFiveMac
        )
    {
        "tech"
    } else if has(&["intl", "international", "world", "china"]) {
        "intl"
    } else {
        "news"
    }
}

fn normalize(mut record: Record, config: &Config, now: DateTime<FixedOffset>) -> Record {
    if is_placeholder_origin(&record.origin) {
        record.origin = origin_name(&record.link);
    }
    if record.category.trim().is_empty() {
        record.category = infer_category(&record.link).to_string();
    }
    if let Some(category) = config.category_overrides.get(&record.origin) {
        record.category = category.clone();
    }
    let tz = now.timezone();
    record.published = record
        .published
        .map(|published| published.with_timezone(&tz).min(now));
    record
}

/// Retention rule by the record's origin name, else by its registry name.
fn retention_rule<'a>(config: &'a Config, record: &Record) -> Option<&'a RetentionRule> {
    config
        .high_volume
        .get(&record.origin)
        .or_else(|| config.high_volume.get(Origin::from_url(&record.link).name()))
}

/// Drop undated and out-of-window records, newest first, at most `max_items`.
fn window(records: Vec<Record>, config: &Config, now: DateTime<FixedOffset>) -> Vec<Record> {
    let common_cutoff = now - config.lookback();
    let mut kept: HashMap<String, usize> = HashMap::new();
    records
        .into_iter()
        .filter(|record| record.published.is_some())
        .sorted_by(|a, b| b.published.cmp(&a.published))
        .filter(|record| {
            let Some(published) = record.published else {
                return false;
            };
            match retention_rule(config, record) {
                Some(rule) => {
                    let lookback = rule.lookback_hours.unwrap_or(config.lookback_hours);
                    if published < now - hours(lookback) {
                        return false;
                    }
                    let count = kept.entry(record.origin.clone()).or_default();
                    *count += 1;
                    *count <= rule.max_items
                }
                None => published >= common_cutoff,
            }
        })
        .take(config.max_items)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Enrichment {
    CacheHit,
    Extracted,
    Failed,
}

#[instrument(level = "info", skip_all, fields(records = records.len()))]
async fn enrich_all(
    records: Vec<Record>,
    config: &Config,
    fetcher: &Fetcher,
    now: DateTime<FixedOffset>,
    stats: &mut RunStats,
) -> Vec<Record> {
    let results: Vec<(Record, Enrichment)> = stream::iter(records)
        .map(|record| enrich(record, config, fetcher, now))
        .buffered(config.concurrency)
        .collect()
        .await;

    for (_, outcome) in &results {
        match outcome {
            Enrichment::CacheHit => stats.cache_hits += 1,
            Enrichment::Extracted => stats.enriched += 1,
            Enrichment::Failed => stats.enrich_failures += 1,
        }
    }
    info!(
        enriched = stats.enriched,
        cache_hits = stats.cache_hits,
        failures = stats.enrich_failures,
        "Enriched records"
    );
    results.into_iter().map(|(record, _)| record).collect()
}

fn apply(record: &mut Record, content: String, hero_image: Option<String>, images: Vec<String>) {
    record.content_text = collapse_whitespace(&strip_markup(&content));
    record.content_html = content;
    if hero_image.is_some() {
        record.hero_image = hero_image;
    }
    record.images = images;
}

/// Fill the record's content from the full-text cache or the article page.
///
/// The record keeps its summary when the page cannot be fetched or yields
/// no content.
async fn enrich(
    mut record: Record,
    config: &Config,
    fetcher: &Fetcher,
    now: DateTime<FixedOffset>,
) -> (Record, Enrichment) {
    let ttl = (config.fulltext_ttl_hours * 3600.0) as i64;
    if let Some(entry) = fetcher.caches().fulltext.get(&record.link) {
        if !entry.content.trim().is_empty() && now.timestamp() - entry.timestamp <= ttl {
            debug!(link = %record.link, "Full-text cache hit");
            apply(&mut record, entry.content, entry.hero_image, entry.images);
            return (record, Enrichment::CacheHit);
        }
    }

    let page = fetcher.fetch_rendered_text(&record.link).await;
    if page.trim().is_empty() {
        return (record, Enrichment::Failed);
    }
    let link = record.link.clone();
    let extraction = match tokio::task::spawn_blocking(move || extract(&page, &link)).await {
        Ok(extraction) => extraction,
        Err(e) => {
            warn!(link = %record.link, error = %e, "Extraction worker failed");
            return (record, Enrichment::Failed);
        }
    };
    if extraction.content.trim().is_empty() {
        debug!(link = %record.link, "No article body found; keeping summary");
        return (record, Enrichment::Failed);
    }

    let hero_image = extraction.hero_image.or_else(|| record.hero_image.clone());
    let sanitizer = Sanitizer::new(config);
    let content = if config.localize_images {
        sanitizer
            .with_localizer(fetcher)
            .sanitize(&extraction.content, &record.link, hero_image.as_deref())
            .await
    } else {
        sanitizer.clean(&extraction.content, &record.link, hero_image.as_deref())
    };
    if content.trim().is_empty() {
        debug!(link = %record.link, "Body empty after sanitizing; keeping summary");
        return (record, Enrichment::Failed);
    }

    fetcher.caches().fulltext.insert(
        record.link.clone(),
        FullTextCacheEntry {
            content: content.clone(),
            hero_image: hero_image.clone(),
            images: extraction.images.clone(),
            timestamp: now.timestamp(),
        },
    );
    apply(&mut record, content, hero_image, extraction.images);
    (record, Enrichment::Extracted)
}

#[instrument(level = "info", skip_all, fields(records = records.len()))]
async fn assemble(records: Vec<Record>, config: &Config, fetcher: &Fetcher) -> Vec<SnapshotEntry> {
    let entries: Vec<Option<SnapshotEntry>> = stream::iter(records)
        .map(|record| async move {
            let hero_img = hero_reference(&record, config, fetcher).await;
            to_entry(record, hero_img)
        })
        .buffered(config.concurrency)
        .collect()
        .await;
    entries.into_iter().flatten().collect()
}

/// Local `images/<file>` path when localization succeeds, else the remote URL.
async fn hero_reference(record: &Record, config: &Config, fetcher: &Fetcher) -> String {
    let Some(url) = record.hero_image.as_deref().filter(|url| !url.is_empty()) else {
        return String::new();
    };
    if url.starts_with(LOCAL_PREFIX) || !config.localize_images {
        return url.to_string();
    }
    match fetcher.download_image(url, Some(&record.link)).await {
        Some(file) => format!("{LOCAL_PREFIX}{file}"),
        None => url.to_string(),
    }
}

fn to_entry(mut record: Record, hero_img: String) -> Option<SnapshotEntry> {
    let published = record.published?;
    let body_text = if record.content_text.is_empty() {
        record.summary.as_str()
    } else {
        record.content_text.as_str()
    };
    record.search_text = truncate_chars(
        &collapse_whitespace(&strip_markup(&format!("{} {}", record.title, body_text))),
        SEARCH_TEXT_LIMIT,
    );
    let content = [&record.content_html, &record.content_text, &record.summary]
        .into_iter()
        .find(|text| !text.trim().is_empty())
        .cloned()
        .unwrap_or_default();

    Some(SnapshotEntry {
        title: record.title,
        link: record.link,
        pub_ts: published.timestamp(),
        pub_fmt: published.format(PUB_FORMAT).to_string(),
        source: record.origin,
        category: record.category,
        hero_img,
        content,
        search_text: record.search_text,
    })
}
