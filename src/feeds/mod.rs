//! Turns one source's raw payload into partially populated [`Record`]s.
//!
//! A payload may be an RSS/Atom document, a WordPress REST post list, or a
//! plain HTML listing page for origins without a working feed. The shape is
//! sniffed from the payload itself and each submodule handles one shape:
//!
//! - [`xml`]: RSS 2.0 and Atom, strict parse with a tolerant fallback
//! - [`wordpress`]: `wp-json/wp/v2/posts` JSON arrays
//! - [`listing`]: per-origin anchor scrapers for HTML listing pages
//!
//! A malformed entry is dropped on its own. Only a payload that cannot be
//! parsed at all is reported as a [`DecodeError`].

pub mod listing;
pub mod wordpress;
pub mod xml;

use chrono::{DateTime, FixedOffset};
use itertools::Itertools;

use crate::models::Record;
use crate::utils::{
    canonicalize_link, is_generic_image, parse_pub_date, resolve_image_url, strip_control_chars,
    strip_markup,
};

/// Bytes inspected for an HTML document signature.
const SNIFF_WINDOW: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("unparsable feed: {0}")]
    Unparsable(String),
    #[error("invalid JSON post list: {0}")]
    Json(#[from] serde_json::Error),
}

/// What the decoder knows about the payload's source.
#[derive(Debug, Clone)]
pub struct DecodeContext {
    pub source_url: String,
    /// Origin name stamped on every record; may be empty.
    pub origin: String,
    pub category: String,
    /// Timestamp given to listing entries that expose none.
    pub now: DateTime<FixedOffset>,
    /// Zone for publish dates written without an offset.
    pub tz: FixedOffset,
}

/// An entry as read from the payload, before normalization.
#[derive(Debug, Default, Clone)]
pub(crate) struct RawEntry {
    pub title: String,
    pub link: String,
    pub published_text: String,
    pub published: Option<DateTime<FixedOffset>>,
    /// Summary markup; stripped during normalization.
    pub summary: String,
    pub image: Option<String>,
}

/// Decode a payload into records.
///
/// # Errors
///
/// Returns [`DecodeError`] only when the payload is empty or yields no parse
/// at all. Individual entries without a usable link are dropped silently.
pub fn decode(payload: &[u8], ctx: &DecodeContext) -> Result<Vec<Record>, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    let text = strip_control_chars(&String::from_utf8_lossy(payload));

    let entries = if looks_like_html(&text) {
        listing::scrape(&text, ctx)
    } else if text.trim_start().starts_with('[') {
        wordpress::parse(&text, ctx)?
    } else {
        xml::parse(&text)?
    };
    Ok(normalize(entries, ctx))
}

fn looks_like_html(text: &str) -> bool {
    let end = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= SNIFF_WINDOW)
        .unwrap_or(text.len());
    let head = text[..end].to_ascii_lowercase();
    head.contains("<!doctype html") || head.contains("<html")
}

/// Canonicalize links, strip markup, parse dates and vet images.
fn normalize(entries: Vec<RawEntry>, ctx: &DecodeContext) -> Vec<Record> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let link = canonicalize_link(&entry.link, Some(&ctx.source_url))?;
            let published = entry
                .published
                .or_else(|| parse_pub_date(&entry.published_text, &ctx.tz));
            let hero_image = entry
                .image
                .map(|raw| resolve_image_url(&link, &raw))
                .filter(|url| !is_generic_image(url, Some(&link)));
            Some(Record {
                title: strip_markup(&entry.title),
                published,
                published_text: entry.published_text.trim().to_string(),
                origin: ctx.origin.clone(),
                category: ctx.category.clone(),
                summary: strip_markup(&entry.summary),
                hero_image,
                link,
                ..Record::default()
            })
        })
        .unique_by(|record| record.link.clone())
        .collect()
}

#[cfg(test)]
pub(crate) fn test_context(source_url: &str) -> DecodeContext {
    let tz = FixedOffset::east_opt(8 * 3600).unwrap();
    DecodeContext {
        source_url: source_url.to_string(),
        origin: "test".to_string(),
        category: "news".to_string(),
        now: chrono::Utc::now().with_timezone(&tz),
        tz,
    }
}
