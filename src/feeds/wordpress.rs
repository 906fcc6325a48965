//! WordPress REST post lists (`/wp-json/wp/v2/posts?_embed=1`).

use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use super::{DecodeContext, DecodeError, RawEntry};
use crate::utils::parse_pub_date;

#[derive(Debug, Default, Deserialize)]
struct Rendered {
    #[serde(default)]
    rendered: String,
}

#[derive(Debug, Default, Deserialize)]
struct Media {
    #[serde(default)]
    source_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Embedded {
    #[serde(rename = "wp:featuredmedia", default)]
    featured_media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(default)]
    link: String,
    #[serde(default)]
    title: Rendered,
    #[serde(default)]
    date_gmt: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    excerpt: Rendered,
    #[serde(rename = "_embedded", default)]
    embedded: Embedded,
}

/// Decode a JSON array of posts.
///
/// Elements that are not post-shaped are skipped; only a payload that is not
/// a JSON array at all is an error.
pub(crate) fn parse(text: &str, ctx: &DecodeContext) -> Result<Vec<RawEntry>, DecodeError> {
    let rows: Vec<serde_json::Value> = serde_json::from_str(text.trim())?;
    Ok(rows
        .into_iter()
        .filter_map(|row| serde_json::from_value::<Post>(row).ok())
        .map(|post| entry_from(post, ctx))
        .collect())
}

fn entry_from(post: Post, ctx: &DecodeContext) -> RawEntry {
    let gmt = post.date_gmt.as_deref().and_then(|text| {
        NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%dT%H:%M:%S")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive).fixed_offset())
    });
    let local_text = post.date.clone().unwrap_or_default();
    let published = gmt.or_else(|| parse_pub_date(&local_text, &ctx.tz));
    let published_text = post.date_gmt.filter(|_| gmt.is_some()).unwrap_or(local_text);

    RawEntry {
        title: post.title.rendered,
        link: post.link,
        published_text,
        published,
        summary: post.excerpt.rendered,
        image: post
            .embedded
            .featured_media
            .into_iter()
            .next()
            .and_then(|media| media.source_url)
            .filter(|url| !url.trim().is_empty()),
    }
}
