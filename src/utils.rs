//! Normalization helpers shared by the decoder, extractors and sanitizer.
//!
//! Everything here is a pure function except [`ensure_writable_dir`]:
//! - Link canonicalization (the deduplication key)
//! - Markup stripping for summaries and search text
//! - Image URL resolution, generic/noise image detection, file-name keys
//! - Publish-date parsing in a reference timezone
//! - String truncation for logs and length-capped fields

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs as stdfs;
use tokio::fs;
use tracing::{info, instrument};
use url::Url;

use crate::error::{Error, Result};

static HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).unwrap());
static SCRIPT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());
static STYLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static SPACE_BEFORE_NL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+\n").unwrap());
static SPACE_AFTER_NL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s+").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static CONTROL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").unwrap());
static CJK_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})年(\d{1,2})月(\d{1,2})日\s*(\d{1,2}):(\d{2})").unwrap());

/// Query parameters that only identify campaigns or click sources.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "igshid", "mc_cid", "mc_eid", "spm"];

/// Substrings marking site logos, share icons and blank pixels.
const GENERIC_IMAGE_KEYS: &[&str] = &[
    "logo",
    "default",
    "placeholder",
    "site-logo",
    "share",
    "social",
    "/seo/",
    "image/seo",
    "/res/v3/image/seo",
    "grey.gif",
    "blank.gif",
    "transparent.gif",
];

/// MingPao serves real article photos from its SEO image path.
const MINGPAO_SEO_KEYS: &[&str] = &["/seo/", "image/seo", "/res/v3/image/seo"];

/// Substrings marking spinners, gallery arrows and loading placeholders.
const NOISE_IMAGE_KEYS: &[&str] = &["waiting.gif", "prev.png", "next.png", "loading", "spinner"];

/// Substrings of `src` values that are lazy-load stand-ins rather than images.
const PLACEHOLDER_SRC_KEYS: &[&str] = &["grey.gif", "blank.gif", "placeholder", "transparent.gif"];

/// Canonicalize a link into the form used as the deduplication key.
///
/// Handles the shapes feeds actually emit: HTML-escaped URLs, whole `<a>`
/// elements, trailing junk after a quote or space, protocol-relative and
/// relative references. The fragment and well-known tracking parameters are
/// removed. Returns `None` unless the result is an absolute http(s) URL.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(
///     canonicalize_link("//example.com/a?utm_source=x#top", None).as_deref(),
///     Some("https://example.com/a")
/// );
/// ```
pub fn canonicalize_link(raw: &str, base: Option<&str>) -> Option<String> {
    let mut link = html_escape::decode_html_entities(raw.trim()).trim().to_string();
    if link.contains("<a") && link.contains("href") {
        if let Some(href) = HREF_RE.captures(&link).map(|c| c[1].trim().to_string()) {
            link = href;
        }
    }
    if let Some((head, _)) = link.split_once('"') {
        link = head.trim().to_string();
    }
    if let Some((head, _)) = link.split_once(char::is_whitespace) {
        link = head.to_string();
    }
    if link.is_empty() {
        return None;
    }
    if link.starts_with("//") {
        link = format!("https:{link}");
    }

    let mut parsed = match Url::parse(&link) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base?).ok()?.join(&link).ok()?,
        Err(_) => return None,
    };
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }
    parsed.set_fragment(None);

    if parsed.query().is_some() {
        let total = parsed.query_pairs().count();
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| !is_tracking_param(k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            parsed.set_query(None);
        } else if kept.len() != total {
            parsed.query_pairs_mut().clear().extend_pairs(&kept);
        }
    }
    Some(parsed.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Remove markup from a summary or fragment, leaving trimmed text.
///
/// Entities are decoded first so escaped markup inside feed text is
/// stripped as well.
pub fn strip_markup(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let text = html_escape::decode_html_entities(value);
    let text = SCRIPT_RE.replace_all(&text, "");
    let text = STYLE_RE.replace_all(&text, "");
    let text = TAG_RE.replace_all(&text, "");
    let text = SPACE_BEFORE_NL_RE.replace_all(&text, "\n");
    let text = SPACE_AFTER_NL_RE.replace_all(&text, "\n");
    text.trim().to_string()
}

/// Collapse every run of whitespace into one space.
pub fn collapse_whitespace(value: &str) -> String {
    WHITESPACE_RE.replace_all(value, " ").trim().to_string()
}

/// Drop ASCII control characters that XML parsers reject outright.
pub fn strip_control_chars(value: &str) -> String {
    CONTROL_RE.replace_all(value, "").into_owned()
}

/// Resolve an image reference found on `base_url` into an absolute URL.
///
/// Returns an empty string for empty input or when resolution fails.
pub fn resolve_image_url(base_url: &str, raw_url: &str) -> String {
    let raw = raw_url.trim();
    if raw.is_empty() {
        return String::new();
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return format!("https://{rest}");
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    Url::parse(base_url)
        .and_then(|base| base.join(raw))
        .map(|u| u.to_string())
        .unwrap_or_default()
}

/// Detect site logos, share icons and blank pixels.
///
/// `origin_link` relaxes the lexicon for origins known to serve legitimate
/// images under paths that look generic.
pub fn is_generic_image(url: &str, origin_link: Option<&str>) -> bool {
    if url.trim().is_empty() {
        return true;
    }
    let lowered = url.to_lowercase();
    let mingpao = origin_link.is_some_and(|link| link.contains("mingpao.com"));
    GENERIC_IMAGE_KEYS
        .iter()
        .filter(|key| !(mingpao && MINGPAO_SEO_KEYS.contains(key)))
        .any(|key| lowered.contains(key))
}

/// Detect spinners, navigation arrows and loading placeholders.
pub fn is_noise_image(url: &str) -> bool {
    let lowered = url.to_lowercase();
    NOISE_IMAGE_KEYS.iter().any(|key| lowered.contains(key))
}

/// Detect `src` values that stand in for a lazily loaded image.
pub fn is_placeholder_src(src: &str) -> bool {
    let lowered = src.trim().to_lowercase();
    lowered.starts_with("data:") || PLACEHOLDER_SRC_KEYS.iter().any(|key| lowered.contains(key))
}

/// Image cache key: the URL without fragment or query.
pub fn image_cache_key(url: &str) -> &str {
    url.split(['#', '?']).next().unwrap_or_default()
}

/// Lowercased last path segment of a URL with its query stripped.
pub fn image_file_name(url: &str) -> String {
    let path = image_cache_key(url);
    let segment = path.rsplit('/').next().unwrap_or_default();
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
        .to_lowercase()
}

/// Parse a publish date in any of the shapes sources emit.
///
/// Accepts RFC 2822, RFC 3339, `YYYY-MM-DD HH:MM[:SS]` and
/// `YYYY年MM月DD日 HH:MM`. Values without an offset are read in `tz`.
pub fn parse_pub_date(text: &str, tz: &FixedOffset) -> Option<DateTime<FixedOffset>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt);
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return tz.from_local_datetime(&naive).single();
        }
    }
    let caps = CJK_DATE_RE.captures(text)?;
    let num = |i: usize| caps[i].parse::<u32>().ok();
    let date = NaiveDate::from_ymd_opt(caps[1].parse().ok()?, num(2)?, num(3)?)?;
    let naive = date.and_hms_opt(num(4)?, num(5)?, 0)?;
    tz.from_local_datetime(&naive).single()
}

/// Domain label before the TLD, used when a source carries no name.
///
/// For example: `"https://www.theguardian.com/world/1"` -> `"theguardian"`.
pub fn host_label(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() >= 2 {
        Some(parts[parts.len() - 2].to_string())
    } else {
        None
    }
}

/// Keep at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Truncate a string for logging purposes.
///
/// Long strings are cut to `max` characters with an ellipsis and a count of
/// the omitted bytes appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…(+{} bytes)", &s[..idx], s.len() - idx),
        None => s.to_string(),
    }
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then writes and deletes a scratch file.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or is not writable
/// (permission denied, read-only filesystem, etc.).
#[instrument(level = "info", skip_all, fields(path = %path))]
pub async fn ensure_writable_dir(path: &str) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    let scratch_path = format!("{}/..__write_check__", path.trim_end_matches('/'));
    match stdfs::File::create(&scratch_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&scratch_path);
            info!("Directory is writable");
            Ok(())
        }
        Err(e) => Err(Error::io(scratch_path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn hkt() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn test_canonicalize_protocol_relative() {
        assert_eq!(
            canonicalize_link("//news.rthk.hk/a/1.htm", None).as_deref(),
            Some("https://news.rthk.hk/a/1.htm")
        );
    }

    #[test]
    fn test_canonicalize_strips_fragment_and_tracking() {
        assert_eq!(
            canonicalize_link("https://example.com/a?id=3&utm_source=rss&fbclid=x#top", None)
                .as_deref(),
            Some("https://example.com/a?id=3")
        );
        assert_eq!(
            canonicalize_link("https://example.com/a?utm_medium=feed", None).as_deref(),
            Some("https://example.com/a")
        );
    }

    #[test]
    fn test_canonicalize_unwraps_anchor_markup() {
        let raw = r#"&lt;a href="https://example.com/story/1"&gt;Story&lt;/a&gt;"#;
        assert_eq!(
            canonicalize_link(raw, None).as_deref(),
            Some("https://example.com/story/1")
        );
    }

    #[test]
    fn test_canonicalize_cuts_trailing_junk() {
        assert_eq!(
            canonicalize_link("https://example.com/a b c", None).as_deref(),
            Some("https://example.com/a")
        );
    }

    #[test]
    fn test_canonicalize_relative_needs_base() {
        assert_eq!(canonicalize_link("/article/1", None), None);
        assert_eq!(
            canonicalize_link("/article/1", Some("https://www.hk01.com")).as_deref(),
            Some("https://www.hk01.com/article/1")
        );
    }

    #[test]
    fn test_canonicalize_rejects_non_http() {
        assert_eq!(canonicalize_link("javascript:void(0)", None), None);
        assert_eq!(canonicalize_link("mailto:a@b.c", None), None);
        assert_eq!(canonicalize_link("   ", None), None);
    }

    #[test]
    fn test_strip_markup() {
        assert_eq!(strip_markup("<p>Hello <b>world</b></p>"), "Hello world");
        assert_eq!(strip_markup("&lt;p&gt;escaped&lt;/p&gt;"), "escaped");
        assert_eq!(
            strip_markup("<script>var x = 1;</script>text<style>p{}</style>"),
            "text"
        );
        assert_eq!(strip_markup(""), "");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a \n\n b\tc "), "a b c");
    }

    #[test]
    fn test_strip_control_chars() {
        assert_eq!(strip_control_chars("a\u{0}b\u{1b}c\nd"), "abc\nd");
    }

    #[test]
    fn test_resolve_image_url() {
        assert_eq!(
            resolve_image_url("https://a.com/news/1.html", "//cdn.a.com/x.jpg"),
            "https://cdn.a.com/x.jpg"
        );
        assert_eq!(
            resolve_image_url("https://a.com/news/1.html", "img/x.jpg"),
            "https://a.com/news/img/x.jpg"
        );
        assert_eq!(
            resolve_image_url("https://a.com/", "http://b.com/y.png"),
            "http://b.com/y.png"
        );
        assert_eq!(resolve_image_url("https://a.com/", "  "), "");
        assert_eq!(resolve_image_url("not a url", "x.jpg"), "");
    }

    #[test]
    fn test_is_generic_image() {
        assert!(is_generic_image("https://a.com/assets/site-logo.png", None));
        assert!(is_generic_image("https://a.com/blank.gif", None));
        assert!(is_generic_image("", None));
        assert!(!is_generic_image("https://a.com/photos/123.jpg", None));
    }

    #[test]
    fn test_mingpao_seo_images_are_legitimate() {
        let url = "https://fs.mingpao.com/res/v3/image/seo/20250101/a.jpg";
        assert!(is_generic_image(url, None));
        assert!(!is_generic_image(url, Some("https://news.mingpao.com/ins/x")));
    }

    #[test]
    fn test_noise_and_placeholder_images() {
        assert!(is_noise_image("https://a.com/img/Loading.gif"));
        assert!(is_noise_image("https://a.com/next.png"));
        assert!(!is_noise_image("https://a.com/photo.jpg"));
        assert!(is_placeholder_src("data:image/gif;base64,R0lGOD"));
        assert!(is_placeholder_src("/images/grey.gif"));
        assert!(!is_placeholder_src("/images/photo.jpg"));
    }

    #[test]
    fn test_image_keys() {
        assert_eq!(
            image_cache_key("https://a.com/x.jpg?w=300#frag"),
            "https://a.com/x.jpg"
        );
        assert_eq!(image_file_name("https://a.com/p/Photo.JPG?w=1"), "photo.jpg");
    }

    #[test]
    fn test_parse_pub_date_rfc2822() {
        let dt = parse_pub_date("Wed, 14 Jan 2026 03:15:00 GMT", &hkt()).unwrap();
        assert_eq!(dt.timestamp(), 1768360500);
    }

    #[test]
    fn test_parse_pub_date_rfc3339() {
        let dt = parse_pub_date("2026-01-14T11:15:00+08:00", &hkt()).unwrap();
        assert_eq!(dt.hour(), 11);
    }

    #[test]
    fn test_parse_pub_date_naive_uses_reference_zone() {
        let dt = parse_pub_date("2026-01-14 11:15", &hkt()).unwrap();
        assert_eq!(dt.offset().local_minus_utc(), 8 * 3600);
        assert_eq!(dt.hour(), 11);
    }

    #[test]
    fn test_parse_pub_date_cjk() {
        let dt = parse_pub_date("2026年01月14日 09:05", &hkt()).unwrap();
        assert_eq!((dt.hour(), dt.minute()), (9, 5));
    }

    #[test]
    fn test_parse_pub_date_garbage() {
        assert!(parse_pub_date("yesterday-ish", &hkt()).is_none());
        assert!(parse_pub_date("", &hkt()).is_none());
    }

    #[test]
    fn test_host_label() {
        assert_eq!(host_label("https://www.theguardian.com/x"), Some("theguardian".to_string()));
        assert_eq!(host_label("not a url"), None);
    }

    #[test]
    fn test_truncate_for_log_short_string() {
        assert_eq!(truncate_for_log("Hello, world!", 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("香港電台新聞", 2), "香港");
        assert!(truncate_for_log("香港電台新聞", 2).starts_with("香港…"));
    }

    #[tokio::test]
    async fn test_ensure_writable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        ensure_writable_dir(nested.to_str().unwrap()).await.unwrap();
        assert!(nested.exists());
    }
}
