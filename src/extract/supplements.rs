//! Images that live outside the content node, recovered from the raw page.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::utils::image_file_name;

static RTHK_LARGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://newsstatic\.rthk\.hk/images/mfile_\d+_\d+_[Ll]\.jpg").unwrap());
static RTHK_ANY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://newsstatic\.rthk\.hk/images/mfile_\d+_\d+_[A-Za-z]+\.jpg").unwrap()
});
static CNBETA_CDN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://static\.cnbetacdn\.com/[^\s"'>]+\.(?:jpg|png|gif|jpeg)"#).unwrap()
});
static GALLERIES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)article_galleries\s*=\s*(\{.*?\});").unwrap());
static TRAILING_BRACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*\}").unwrap());
static TRAILING_BRACKET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*\]").unwrap());
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(gallery-[\w-]+)\b[^>]*?(?:/>|>\s*</gallery-[\w-]+\s*>)").unwrap()
});

/// CnBeta images never worth a figure of their own.
const CNBETA_JUNK: &[&str] = &["icon", "thumb", "recommend", "logo", "avatar", "ads"];

fn figure(url: &str) -> String {
    format!(
        r#"<figure><img src="{}"></figure>"#,
        html_escape::encode_double_quoted_attribute(url)
    )
}

/// Add RTHK photos missing from `images` and prepend them to `content`.
pub(crate) fn rthk_newsstatic(page: &str, content: &mut String, images: &mut Vec<String>) {
    let mut found: Vec<&str> = RTHK_LARGE_RE.find_iter(page).map(|m| m.as_str()).collect();
    if found.is_empty() {
        found = RTHK_ANY_RE.find_iter(page).map(|m| m.as_str()).collect();
    }
    let mut seen: HashSet<String> = images.iter().cloned().collect();
    let fresh: Vec<String> = found
        .into_iter()
        .filter(|url| seen.insert(url.to_string()))
        .map(str::to_string)
        .collect();
    if fresh.is_empty() {
        return;
    }

    let gallery: String = fresh
        .iter()
        .filter(|url| !content.contains(url.as_str()))
        .map(|url| figure(url))
        .collect();
    content.insert_str(0, &gallery);
    images.extend(fresh);
}

/// Add CnBeta CDN images missing from `images` and append them to `content`.
///
/// Images are compared by file name since the same photo shows up under
/// several sizes and hosts.
pub(crate) fn cnbeta_cdn(page: &str, content: &mut String, images: &mut Vec<String>) {
    let mut seen: HashSet<String> = images.iter().map(|url| image_file_name(url)).collect();
    let fresh: Vec<String> = CNBETA_CDN_RE
        .find_iter(page)
        .map(|m| m.as_str())
        .filter(|url| !url.to_lowercase().contains("icon"))
        .filter(|url| seen.insert(image_file_name(url)))
        .map(str::to_string)
        .collect();
    if fresh.is_empty() {
        return;
    }

    let lowered = content.to_lowercase();
    let gallery: String = fresh
        .iter()
        .filter(|url| {
            let lower_url = url.to_lowercase();
            !lowered.contains(&image_file_name(url))
                && !CNBETA_JUNK.iter().any(|junk| lower_url.contains(junk))
        })
        .map(|url| figure(url))
        .collect();
    content.push_str(&gallery);
    images.extend(fresh);
}

/// Parse the `article_galleries = {...};` mapping, tolerating trailing commas.
pub(crate) fn singtao_galleries(page: &str) -> Map<String, Value> {
    let Some(raw) = GALLERIES_RE.captures(page).and_then(|c| c.get(1)) else {
        return Map::new();
    };
    let raw = raw.as_str();
    serde_json::from_str(raw)
        .or_else(|_| {
            let relaxed = TRAILING_BRACE_RE.replace_all(raw, "}");
            let relaxed = TRAILING_BRACKET_RE.replace_all(&relaxed, "]");
            serde_json::from_str(&relaxed)
        })
        .unwrap_or_default()
}

fn gallery_item_src(item: &Value) -> Option<String> {
    let src = item.get("src").and_then(Value::as_str).unwrap_or_default().trim();
    if !src.is_empty() {
        return Some(src.to_string());
    }
    item.get("srcset")
        .and_then(Value::as_str)?
        .split(',')
        .next()?
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Every image URL in the mapping.
pub(crate) fn gallery_urls(galleries: &Map<String, Value>) -> Vec<String> {
    galleries
        .values()
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(gallery_item_src)
        .collect()
}

fn gallery_html(items: &[Value]) -> String {
    let images: String = items
        .iter()
        .filter_map(|item| {
            let src = gallery_item_src(item)?;
            let alt = ["caption", "alt_text"]
                .iter()
                .find_map(|key| item.get(key).and_then(Value::as_str))
                .unwrap_or_default();
            Some(format!(
                r#"<img src="{}" alt="{}">"#,
                html_escape::encode_double_quoted_attribute(&src),
                html_escape::encode_double_quoted_attribute(alt)
            ))
        })
        .collect();
    if images.is_empty() {
        String::new()
    } else {
        format!(r#"<div class="st-gallery">{images}</div>"#)
    }
}

/// Replace every `<gallery-*>` placeholder with its images.
///
/// Placeholders whose key is missing from the mapping are removed.
pub(crate) fn expand_galleries(content: &str, galleries: &Map<String, Value>) -> String {
    if !content.to_ascii_lowercase().contains("<gallery-") {
        return content.to_string();
    }
    PLACEHOLDER_RE
        .replace_all(content, |caps: &Captures| {
            let key = caps[1].to_ascii_lowercase();
            galleries
                .iter()
                .find(|(name, _)| name.to_ascii_lowercase() == key)
                .and_then(|(_, items)| items.as_array())
                .map(|items| gallery_html(items))
                .unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rthk_prefers_large_variants() {
        let page = r#"<div>
<img src="https://newsstatic.rthk.hk/images/mfile_1_2_S.jpg">
<a href="https://newsstatic.rthk.hk/images/mfile_1_2_L.jpg">大圖</a>
<a href="https://newsstatic.rthk.hk/images/mfile_1_3_L.jpg">大圖</a>
</div>"#;
        let mut content = "<p>body</p>".to_string();
        let mut images = vec!["https://newsstatic.rthk.hk/images/mfile_1_3_L.jpg".to_string()];
        rthk_newsstatic(page, &mut content, &mut images);
        assert_eq!(
            content,
            r#"<figure><img src="https://newsstatic.rthk.hk/images/mfile_1_2_L.jpg"></figure><p>body</p>"#
        );
        assert_eq!(images.len(), 2);

        let mut content = String::new();
        let mut images = Vec::new();
        rthk_newsstatic(
            r#"<img src="https://newsstatic.rthk.hk/images/mfile_9_9_M.jpg">"#,
            &mut content,
            &mut images,
        );
        assert_eq!(images, vec!["https://newsstatic.rthk.hk/images/mfile_9_9_M.jpg"]);
    }

    #[test]
    fn test_cnbeta_dedupes_by_file_name() {
        let page = r#"
<img src="https://static.cnbetacdn.com/article/2026/0114/a1b2c3.jpg">
<img src="https://static.cnbetacdn.com/thumb/2026/0114/a1b2c3.jpg">
<img src="https://static.cnbetacdn.com/article/2026/0114/d4e5f6.png">
<img src="https://static.cnbetacdn.com/topics/icon-apple.png">
<img src="https://static.cnbetacdn.com/thumb/2026/0114/small9.jpg">"#;
        let mut content = r#"<p><img src="/x/d4e5f6.png"></p>"#.to_string();
        let mut images = Vec::new();
        cnbeta_cdn(page, &mut content, &mut images);

        assert_eq!(
            images,
            vec![
                "https://static.cnbetacdn.com/article/2026/0114/a1b2c3.jpg",
                "https://static.cnbetacdn.com/article/2026/0114/d4e5f6.png",
                "https://static.cnbetacdn.com/thumb/2026/0114/small9.jpg",
            ]
        );
        assert!(content.ends_with(
            r#"<figure><img src="https://static.cnbetacdn.com/article/2026/0114/a1b2c3.jpg"></figure>"#
        ));
        assert!(!content.contains("small9"));
    }

    #[test]
    fn test_singtao_galleries_tolerate_trailing_commas() {
        let page = r#"<script>var article_galleries = {"gallery-12": [
  {"src": "https://image.hkhl.hk/f/1.jpg", "caption": "相片一",},
  {"srcset": "https://image.hkhl.hk/f/2.jpg 800w, https://image.hkhl.hk/f/2s.jpg 400w"},
],};</script>"#;
        let galleries = singtao_galleries(page);
        assert_eq!(
            gallery_urls(&galleries),
            vec!["https://image.hkhl.hk/f/1.jpg", "https://image.hkhl.hk/f/2.jpg"]
        );

        let content = r#"<p>前</p><gallery-12 data-x="1"></gallery-12><p>中</p><gallery-99></gallery-99><p>後</p>"#;
        let expanded = expand_galleries(content, &galleries);
        assert_eq!(
            expanded,
            concat!(
                "<p>前</p>",
                r#"<div class="st-gallery"><img src="https://image.hkhl.hk/f/1.jpg" alt="相片一"><img src="https://image.hkhl.hk/f/2.jpg" alt=""></div>"#,
                "<p>中</p><p>後</p>",
            )
        );
    }

    #[test]
    fn test_placeholders_removed_without_mapping() {
        let galleries = singtao_galleries("<html>no script</html>");
        assert!(galleries.is_empty());
        assert_eq!(
            expand_galleries("<p>a</p><gallery-1/><p>b</p>", &galleries),
            "<p>a</p><p>b</p>"
        );
    }
}
