//! Full-page article extraction.
//!
//! Each origin gets a [`Strategy`] from a static table: ordered content
//! selectors, image locators, and optional origin-specific extras.
//!
//! | Origin | Content | Extras |
//! |--------|---------|--------|
//! | RTHK | `itemFullText` | `newsstatic` large photos prepended, lead figure |
//! | Ming Pao | `article.txt4`, `#upper` | fancybox lightbox hrefs |
//! | Sing Tao | `article-content`, `main-body` | `article_galleries` placeholders |
//! | CnBeta | `#article_content` | CDN images appended, lead figure |
//! | HK01 | `__NEXT_DATA__` blocks | falls back to `<article>` |
//! | others | `article`, `div[class*=content]` | |
//!
//! Extraction is a pure function of the page and link. It parses with
//! `scraper`, whose documents are not `Send`, so async callers run it under
//! `spawn_blocking`.

mod hk01;
mod strategy;
mod supplements;

pub use strategy::{ImageLocator, Strategy, Supplement, select_strategy};

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::utils::{image_file_name, is_noise_image, resolve_image_url};

/// Body markup and imagery pulled from an article page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub content: String,
    pub hero_image: Option<String>,
    pub images: Vec<String>,
}

/// Extract the article body, hero image and image list from `page`.
///
/// The strategy is chosen from the host of `link`; sites without a dedicated
/// strategy go through the generic one.
///
/// # Arguments
///
/// * `page` - Raw HTML of the article page
/// * `link` - Article URL, used for strategy selection and to resolve relative images
///
/// # Returns
///
/// An [`Extraction`], empty when nothing matches.
pub fn extract(page: &str, link: &str) -> Extraction {
    if page.trim().is_empty() {
        return Extraction::default();
    }
    let strategy = select_strategy(link);
    let document = Html::parse_document(page);

    let mut hero = meta_image(&document);
    let (mut content, mut images) = body(&document, page, &strategy);

    if strategy.lead_figure {
        if let Some(first) = images.first() {
            let name = image_file_name(first);
            if !name.is_empty() && !content.to_lowercase().contains(&name) {
                content.insert_str(
                    0,
                    &format!(
                        r#"<figure><img src="{}"></figure>"#,
                        html_escape::encode_double_quoted_attribute(first)
                    ),
                );
            }
        }
    }
    match strategy.supplement {
        Some(Supplement::RthkNewsstatic) => {
            supplements::rthk_newsstatic(page, &mut content, &mut images)
        }
        Some(Supplement::CnBetaCdn) => supplements::cnbeta_cdn(page, &mut content, &mut images),
        None => {}
    }
    if strategy.galleries {
        let galleries = supplements::singtao_galleries(page);
        content = supplements::expand_galleries(&content, &galleries);
        images.extend(supplements::gallery_urls(&galleries));
    }

    let mut seen = std::collections::HashSet::new();
    images = images
        .into_iter()
        .map(|url| resolve_image_url(link, &url))
        .filter(|url| !url.is_empty() && !is_noise_image(url))
        .filter(|url| seen.insert(url.clone()))
        .collect();
    hero = hero
        .map(|url| resolve_image_url(link, &url))
        .filter(|url| !url.is_empty() && !is_noise_image(url));
    let hero_image = hero.or_else(|| images.first().cloned());

    debug!(
        %link,
        origin = %strategy.origin,
        content_len = content.len(),
        images = images.len(),
        "Extracted article"
    );
    Extraction {
        content,
        hero_image,
        images,
    }
}

/// `og:image`, else `twitter:image`.
fn meta_image(document: &Html) -> Option<String> {
    ["meta[property='og:image']", "meta[name='twitter:image']"]
        .iter()
        .filter_map(|css| Selector::parse(css).ok())
        .find_map(|selector| {
            document
                .select(&selector)
                .filter_map(|meta| meta.value().attr("content"))
                .map(str::trim)
                .find(|url| !url.is_empty())
                .map(str::to_string)
        })
}

/// Content markup and structural images for the strategy.
fn body(document: &Html, page: &str, strategy: &Strategy) -> (String, Vec<String>) {
    if strategy.next_data_blocks {
        if let Some(replay) = hk01::replay_blocks(page) {
            return (replay.content, replay.images);
        }
        debug!("No usable __NEXT_DATA__ blocks; using the rendered article");
    }

    let node = strategy
        .content
        .iter()
        .filter_map(|css| Selector::parse(css).ok())
        .find_map(|selector| document.select(&selector).find(|el| has_substance(*el)));
    let Some(node) = node else {
        return (String::new(), Vec::new());
    };

    let images = if strategy.images.is_empty() {
        images_within(node)
    } else {
        located_images(document, strategy.images)
    };
    (node.html(), images)
}

fn has_substance(element: ElementRef<'_>) -> bool {
    element.text().any(|t| !t.trim().is_empty())
        || Selector::parse("img")
            .map(|img| element.select(&img).next().is_some())
            .unwrap_or(false)
}

fn images_within(node: ElementRef<'_>) -> Vec<String> {
    let Ok(selector) = Selector::parse("img[src]") else {
        return Vec::new();
    };
    node.select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(|src| src.trim().to_string())
        .filter(|src| !src.is_empty())
        .collect()
}

fn located_images(document: &Html, locators: &[ImageLocator]) -> Vec<String> {
    let mut found = Vec::new();
    for locator in locators {
        let Ok(selector) = Selector::parse(locator.selector) else {
            continue;
        };
        for element in document.select(&selector) {
            found.extend(
                locator
                    .attrs
                    .iter()
                    .filter_map(|attr| element.value().attr(attr))
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string),
            );
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_page() {
        assert_eq!(extract("", "https://a.com/1"), Extraction::default());
        let none = extract("<html><body><nav>menu</nav></body></html>", "https://a.com/1");
        assert!(none.content.is_empty());
        assert_eq!(none.hero_image, None);
    }

    #[test]
    fn test_generic_locators_and_meta_hero() {
        let page = r#"<html><head>
<meta property="og:image" content="/img/hero.jpg">
<meta name="twitter:image" content="https://a.com/img/tw.jpg">
</head><body>
<article></article>
<div class="main-content"><p>Body text</p><img src="/img/inline.jpg"><img src="/img/loading.gif"></div>
</body></html>"#;
        let got = extract(page, "https://a.com/news/1");
        assert!(got.content.starts_with(r#"<div class="main-content">"#));
        assert!(got.content.contains("Body text"));
        assert_eq!(got.hero_image.as_deref(), Some("https://a.com/img/hero.jpg"));
        assert_eq!(got.images, vec!["https://a.com/img/inline.jpg"]);
    }

    #[test]
    fn test_noise_hero_falls_back_to_first_image() {
        let page = r#"<html><head><meta property="og:image" content="https://a.com/spinner.gif"></head>
<body><article><p>Text</p><img src="https://a.com/waiting.gif"><img src="https://a.com/real.jpg"></article></body></html>"#;
        let got = extract(page, "https://a.com/news/2");
        assert_eq!(got.hero_image.as_deref(), Some("https://a.com/real.jpg"));
        assert_eq!(got.images, vec!["https://a.com/real.jpg"]);
    }

    #[test]
    fn test_rthk_lead_figure_and_newsstatic() {
        let page = r#"<html><body>
<div class="itemImage"><img data-src="https://newsstatic.rthk.hk/images/mfile_1_1_L.jpg"></div>
<div class="itemFullText">政府今日公布<br>詳情</div>
<script>var g = ["https://newsstatic.rthk.hk/images/mfile_1_2_L.jpg"];</script>
</body></html>"#;
        let got = extract(page, "https://news.rthk.hk/rthk/ch/component/k2/1.htm");
        let first = got.content.find("mfile_1_1_L").unwrap();
        let second = got.content.find("mfile_1_2_L").unwrap();
        let body = got.content.find("政府今日公布").unwrap();
        assert!(second < first && first < body);
        assert_eq!(got.images.len(), 2);
        assert_eq!(
            got.hero_image.as_deref(),
            Some("https://newsstatic.rthk.hk/images/mfile_1_1_L.jpg")
        );
    }

    #[test]
    fn test_cnbeta_lead_figure_skipped_when_present() {
        let page = r#"<html><body><div id="article_content">
<p>内容</p><img src="https://static.cnbetacdn.com/article/a1.jpg">
</div></body></html>"#;
        let got = extract(page, "https://www.cnbeta.com.tw/articles/tech/1.htm");
        assert_eq!(got.content.matches("a1.jpg").count(), 1);
        assert!(!got.content.starts_with("<figure>"));
    }

    #[test]
    fn test_singtao_gallery_placeholder() {
        let page = r#"<html><body>
<div class="article-content"><p>內文</p><gallery-7></gallery-7></div>
<script>article_galleries = {"gallery-7": [{"src": "https://image.hkhl.hk/f/7.jpg"}]};</script>
</body></html>"#;
        let got = extract(page, "https://www.stheadline.com/realtime-china/1/");
        assert!(!got.content.contains("<gallery-"));
        assert!(got.content.contains(r#"<img src="https://image.hkhl.hk/f/7.jpg""#));
        assert_eq!(got.images, vec!["https://image.hkhl.hk/f/7.jpg"]);
    }

    #[test]
    fn test_hk01_falls_back_to_article() {
        let page = r#"<html><body><article><p>HK01 內文</p><img src="https://cdn.hk01.com/a.jpg"></article></body></html>"#;
        let got = extract(page, "https://www.hk01.com/article/1");
        assert!(got.content.starts_with("<article>"));
        assert_eq!(got.images, vec!["https://cdn.hk01.com/a.jpg"]);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let page = r#"<html><body><div id="article_content"><p>x</p></div>
<img src="https://static.cnbetacdn.com/article/z9.png"></body></html>"#;
        let link = "https://www.cnbeta.com.tw/articles/tech/2.htm";
        assert_eq!(extract(page, link), extract(page, link));
    }
}
