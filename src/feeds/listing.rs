//! Scrapers for origins that only publish HTML listing pages.
//!
//! Listing pages rarely carry trustworthy publish times, so entries get the
//! decode context's "now" unless the page embeds a real timestamp.

use chrono::{TimeZone, Utc};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use super::{DecodeContext, RawEntry};
use crate::origin::Origin;
use crate::utils::{collapse_whitespace, strip_markup};

const MIN_TITLE_CHARS: usize = 5;

static NEXT_DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<script[^>]*id=["']__NEXT_DATA__["'][^>]*>(.*?)</script>"#).unwrap()
});
static ARTICLE_PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/article/(\d+)").unwrap());
static LONG_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{5,}").unwrap());
static ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<a\b[^>]*?href=["']([^"']*)["'][^>]*>(.*?)</a>"#).unwrap());

/// Scrape a listing page with the scraper matching the source's origin.
pub(crate) fn scrape(text: &str, ctx: &DecodeContext) -> Vec<RawEntry> {
    let origin = Origin::from_url(&ctx.source_url);
    let base = origin.listing_base().unwrap_or(ctx.source_url.as_str());
    let Ok(base) = Url::parse(base) else {
        return Vec::new();
    };

    let mut entries = match origin {
        Origin::Hk01 => hk01(text, &base, ctx),
        Origin::OnCc => oncc(text, &base),
        Origin::TheWitness => thewitness(text, &base),
        _ => same_host_numeric(text, &base),
    };
    for entry in &mut entries {
        if entry.published.is_none() {
            entry.published = Some(ctx.now);
        }
    }
    debug!(source = %ctx.source_url, %origin, count = entries.len(), "Scraped listing page");
    entries
}

/// Absolute href and title of every anchor on the page.
fn anchors(text: &str, base: &Url) -> Vec<(String, String)> {
    let document = Html::parse_document(text);
    let selector = Selector::parse("a[href]").unwrap();
    document
        .select(&selector)
        .filter_map(|a| {
            let href = a.value().attr("href")?.trim();
            let absolute = base.join(href).ok()?.to_string();
            let title = a
                .value()
                .attr("title")
                .map(str::to_string)
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| a.text().collect::<String>());
            Some((absolute, collapse_whitespace(&title)))
        })
        .collect()
}

fn titled(entries: Vec<(String, String)>) -> Vec<RawEntry> {
    entries
        .into_iter()
        .filter(|(_, title)| title.chars().count() >= MIN_TITLE_CHARS)
        .map(|(link, title)| RawEntry {
            title,
            link,
            ..RawEntry::default()
        })
        .collect()
}

fn hk01(text: &str, base: &Url, ctx: &DecodeContext) -> Vec<RawEntry> {
    let from_json = hk01_next_data(text, base, ctx);
    if !from_json.is_empty() {
        return from_json;
    }

    let from_anchors = titled(
        anchors(text, base)
            .into_iter()
            .filter(|(href, _)| href.contains("/article/"))
            .collect(),
    );
    if !from_anchors.is_empty() {
        return from_anchors;
    }

    // Last resort: bare article paths anywhere in the page.
    let mut anchor_titles = std::collections::HashMap::new();
    for c in ANCHOR_RE.captures_iter(text) {
        if let Some(path) = ARTICLE_PATH_RE.find(&c[1]) {
            anchor_titles
                .entry(path.as_str().to_string())
                .or_insert_with(|| strip_markup(&c[2]));
        }
    }
    let mut seen = std::collections::HashSet::new();
    let found: Vec<(String, String)> = ARTICLE_PATH_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|path| seen.insert(*path))
        .filter_map(|path| {
            let title = anchor_titles.get(path)?;
            Some((base.join(path).ok()?.to_string(), collapse_whitespace(title)))
        })
        .collect();
    titled(found)
}

/// Walk the embedded Next.js state for article-shaped objects.
fn hk01_next_data(text: &str, base: &Url, ctx: &DecodeContext) -> Vec<RawEntry> {
    let Some(raw) = NEXT_DATA_RE.captures(text).map(|c| c[1].to_string()) else {
        return Vec::new();
    };
    let Ok(data) = serde_json::from_str::<Value>(&raw) else {
        debug!("HK01 __NEXT_DATA__ present but not valid JSON");
        return Vec::new();
    };
    let mut out = Vec::new();
    walk_articles(&data, base, ctx, &mut out);
    out.into_iter().unique_by(|entry| entry.link.clone()).collect()
}

fn walk_articles(value: &Value, base: &Url, ctx: &DecodeContext, out: &mut Vec<RawEntry>) {
    match value {
        Value::Object(map) => {
            if let Some(entry) = article_like(map, base, ctx) {
                out.push(entry);
            }
            for child in map.values() {
                walk_articles(child, base, ctx, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_articles(item, base, ctx, out);
            }
        }
        _ => {}
    }
}

fn article_like(map: &Map<String, Value>, base: &Url, ctx: &DecodeContext) -> Option<RawEntry> {
    let data = map.get("data").and_then(Value::as_object);
    let field = |key: &str| map.get(key).or_else(|| data.and_then(|d| d.get(key)));

    let title = field("title")
        .and_then(Value::as_str)
        .filter(|t| t.chars().count() >= MIN_TITLE_CHARS)?;
    let url = ["publishUrl", "url", "originalUrl"]
        .iter()
        .filter_map(|key| field(key).and_then(Value::as_str))
        .find(|url| url.contains("/article/"));
    let link = match (url, field("articleId")) {
        (Some(url), _) => base.join(url).ok()?.to_string(),
        (None, Some(Value::Number(id))) => base.join(&format!("/article/{id}")).ok()?.to_string(),
        (None, Some(Value::String(id))) if !id.is_empty() => {
            base.join(&format!("/article/{id}")).ok()?.to_string()
        }
        _ => return None,
    };
    let published = field("publishTime")
        .and_then(Value::as_i64)
        .filter(|&secs| secs > 0)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|dt| dt.with_timezone(&ctx.tz));

    Some(RawEntry {
        title: title.to_string(),
        link,
        published,
        ..RawEntry::default()
    })
}

fn oncc(text: &str, base: &Url) -> Vec<RawEntry> {
    titled(
        anchors(text, base)
            .into_iter()
            .filter(|(href, _)| {
                (href.contains("/bkn/cnt/") || (href.contains("/news/") && href.ends_with(".html")))
                    && !href.contains("index.html")
            })
            .collect(),
    )
}

fn thewitness(text: &str, base: &Url) -> Vec<RawEntry> {
    let prefix = base.as_str();
    titled(
        anchors(text, base)
            .into_iter()
            .filter(|(href, _)| {
                href.starts_with(prefix)
                    && href.len() > prefix.len()
                    && !["/category/", "/tag/", "#"].iter().any(|s| href.contains(s))
            })
            .collect(),
    )
}

fn same_host_numeric(text: &str, base: &Url) -> Vec<RawEntry> {
    let host = base.host_str().unwrap_or_default().to_string();
    titled(
        anchors(text, base)
            .into_iter()
            .filter(|(href, _)| {
                Url::parse(href).is_ok_and(|url| {
                    url.host_str() == Some(host.as_str()) && LONG_NUMBER_RE.is_match(url.path())
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{decode, test_context};

    #[test]
    fn test_hk01_next_data() {
        let ctx = test_context("https://www.hk01.com/latest");
        let page = r#"<!DOCTYPE html><html><body>
<script id="__NEXT_DATA__" type="application/json">
{"props":{"pageProps":{"sections":[
  {"data":{"title":"立法會今日三讀通過條例","publishUrl":"/article/60313027","publishTime":1768360500}},
  {"title":"只有編號的文章標題","articleId":60313028},
  {"title":"短","articleId":1}
]}}}
</script></body></html>"#;
        let entries = scrape(page, &ctx);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].link, "https://www.hk01.com/article/60313027");
        assert_eq!(entries[0].published.unwrap().timestamp(), 1768360500);
        assert_eq!(entries[1].link, "https://www.hk01.com/article/60313028");
        assert_eq!(entries[1].published, Some(ctx.now));
    }

    #[test]
    fn test_hk01_anchor_and_regex_fallbacks() {
        let ctx = test_context("https://www.hk01.com/zone/1");
        let anchors_page = r#"<html><body>
<a href="/article/111111">第一篇新聞標題內容</a>
<a href="/zone/2">分區</a>
</body></html>"#;
        let entries = scrape(anchors_page, &ctx);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "第一篇新聞標題內容");

        let regex_page = r#"<html><body><div data-x='<a href="/article/222222">以正則找到的標題</a>'></div></body></html>"#;
        let entries = hk01(regex_page, &Url::parse("https://www.hk01.com").unwrap(), &ctx);
        assert!(entries.iter().any(|e| e.link == "https://www.hk01.com/article/222222"));
    }

    #[test]
    fn test_hk01_regex_fallback_matches_exact_paths() {
        let ctx = test_context("https://www.hk01.com/zone/1");
        let page = concat!(
            r#"<div data-a='<a href="/article/3333339">較長編號的另一篇標題</a>'></div>"#,
            r#"<div data-b='<a class="x" href="/article/333333">正確編號的新聞標題</a>'></div>"#,
        );
        let entries = hk01(page, &Url::parse("https://www.hk01.com").unwrap(), &ctx);
        let exact = entries
            .iter()
            .find(|e| e.link == "https://www.hk01.com/article/333333")
            .unwrap();
        assert_eq!(exact.title, "正確編號的新聞標題");
    }

    #[test]
    fn test_oncc_listing() {
        let ctx = test_context("https://hk.on.cc/hk/news/index.html");
        let page = r#"<html><body>
<a href="/hk/bkn/cnt/news/20250116/bkn-20250116_00822_001.html" title="東網即時新聞標題">x</a>
<a href="/hk/news/index.html">即時新聞首頁連結</a>
<a href="/hk/news/2025/01/16/a.html">另一則新聞的標題</a>
<a href="/hk/bkn/cnt/news/20250116/b.html">短</a>
</body></html>"#;
        let entries = scrape(page, &ctx);
        let links: Vec<&str> = entries.iter().map(|e| e.link.as_str()).collect();
        assert_eq!(
            links,
            vec![
                "https://hk.on.cc/hk/bkn/cnt/news/20250116/bkn-20250116_00822_001.html",
                "https://hk.on.cc/hk/news/2025/01/16/a.html",
            ]
        );
        assert_eq!(entries[0].title, "東網即時新聞標題");
    }

    #[test]
    fn test_thewitness_listing() {
        let ctx = test_context("https://thewitnesshk.com/");
        let page = r#"<html><body>
<a href="https://thewitnesshk.com/2026/01/14/a-story/">A story worth reading</a>
<a href="https://thewitnesshk.com/category/news/">Category page link</a>
<a href="https://thewitnesshk.com/2026/01/14/a-story/#comments">Comments anchor</a>
<a href="https://elsewhere.com/x">Elsewhere entirely</a>
</body></html>"#;
        let entries = scrape(page, &ctx);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].link, "https://thewitnesshk.com/2026/01/14/a-story/");
    }

    #[test]
    fn test_generic_listing_and_decode_dispatch() {
        let ctx = test_context("https://news.example.com/latest");
        let page = br#"<!DOCTYPE html><html><body>
<a href="/story/1234567">Generic numbered story</a>
<a href="/about">About this website</a>
<a href="https://other.com/story/1234567">Other host story</a>
<a href="/story/1234567">Generic numbered story</a>
</body></html>"#;
        let records = decode(page, &ctx).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].link, "https://news.example.com/story/1234567");
        assert_eq!(records[0].published, Some(ctx.now));
    }
}
