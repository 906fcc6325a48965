//! The synchronous cleaning passes.
//!
//! Every pass takes the top-level node list and a [`PassContext`]. A pass
//! that returns an error is discarded by the caller, which keeps the tree
//! as it was before the pass ran.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use url::Url;

use super::SanitizeError;
use super::dom::{Element, Node, for_each_element, image_sources, remove_where, unwrap_where};
use crate::config::BoilerplateRules;
use crate::origin::Origin;
use crate::utils::{
    image_file_name, is_generic_image, is_noise_image, is_placeholder_src, resolve_image_url,
};

/// Prefix of image references already rewritten to a local file.
pub const LOCAL_PREFIX: &str = "images/";

const INTERACTIVE_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "video", "button", "ad", "articleflag",
];
const INTERACTIVE_CLASSES: &[&str] = &[
    "loading",
    "spinner",
    "videoHolder",
    "video-holder",
    "audioPlayer",
    "audio-player",
];
const INTERACTIVE_ID_PREFIXES: &[&str] = &["videoplayer_", "videospan_"];

/// Origins whose reader view carries no outbound links.
const LINKLESS_ORIGINS: &[Origin] = &[
    Origin::Hk01,
    Origin::CnBeta,
    Origin::Unwire,
    Origin::MingPao,
    Origin::Singtao,
];

/// Line patterns only apply to elements shorter than this.
const LINE_PATTERN_MAX_CHARS: usize = 30;
/// Tail markers only apply to elements shorter than this.
const TAIL_MARKER_MAX_CHARS: usize = 150;
/// Share of the document after which a tail marker cuts everything after it.
const TAIL_START: f64 = 0.4;
/// Shorter file names are too generic to compare.
const MIN_FILE_NAME_CHARS: usize = 5;

const CNBETA_BROKEN_IMAGE_KEYS: &[&str] =
    &["icon", "share", "logo", "pixel", "blank", "transparent"];
const CNBETA_JUNK_TAGS: &[&str] = &["span", "div", "i", "b", "strong", "p", "figure"];
const CNBETA_SHARE_FRAGMENTS: &[&str] = &["分享", "到", "分享到"];

static SINGTAO_RESIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/f/\d+p0/0x0/[^/]+/").unwrap());
static NON_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\W_]+").unwrap());
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w\u{4e00}-\u{9fff}]").unwrap());

pub(crate) struct PassContext<'a> {
    pub origin: Origin,
    /// Page the fragment came from; relative references resolve against it.
    pub link: &'a str,
    pub hero_image: Option<&'a str>,
    pub rules: &'a BoilerplateRules,
}

pub(crate) fn strip_interactive(nodes: &mut Vec<Node>, _ctx: &PassContext<'_>) -> Result<(), SanitizeError> {
    remove_where(nodes, &|el| {
        INTERACTIVE_TAGS.contains(&el.tag.as_str())
            || el.tag.starts_with("gallery-")
            || INTERACTIVE_CLASSES.iter().any(|class| el.class_contains(class))
            || el
                .attr("id")
                .is_some_and(|id| INTERACTIVE_ID_PREFIXES.iter().any(|p| id.starts_with(p)))
    });
    for_each_element(nodes, &mut |el| el.remove_attr("style"));
    Ok(())
}

pub(crate) fn strip_boilerplate(nodes: &mut Vec<Node>, ctx: &PassContext<'_>) -> Result<(), SanitizeError> {
    let rules = ctx.rules;
    let patterns = rules
        .line_patterns
        .iter()
        .map(|pattern| Regex::new(pattern))
        .collect::<Result<Vec<_>, _>>()?;
    let fragments: Vec<&str> = non_empty(&rules.class_fragments);
    let phrases: Vec<&str> = non_empty(&rules.phrases);

    remove_where(nodes, &|el| {
        if fragments.iter().any(|f| el.class_contains(f)) {
            return true;
        }
        let own = el.own_text();
        if phrases.iter().any(|p| own.contains(p)) {
            return true;
        }
        if patterns.is_empty() {
            return false;
        }
        let text = el.text();
        let text = text.trim();
        text.chars().count() < LINE_PATTERN_MAX_CHARS && patterns.iter().any(|re| re.is_match(text))
    });

    let markers = non_empty(&rules.tail_markers);
    if !markers.is_empty() {
        let total = count_elements(nodes);
        let mut position = 0;
        cut_tail(nodes, &markers, total, &mut position);
    }
    Ok(())
}

fn non_empty(items: &[String]) -> Vec<&str> {
    items
        .iter()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .collect()
}

fn count_elements(nodes: &[Node]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            Node::Element(el) => 1 + count_elements(&el.children),
            Node::Text(_) => 0,
        })
        .sum()
}

/// A marker early in the document removes only its element; a marker in the
/// tail removes its element and every following sibling.
fn cut_tail(nodes: &mut Vec<Node>, markers: &[&str], total: usize, position: &mut usize) {
    let mut i = 0;
    while i < nodes.len() {
        let Node::Element(el) = &mut nodes[i] else {
            i += 1;
            continue;
        };
        let here = *position;
        *position += 1;

        let text = el.text();
        let text = text.trim();
        let hit = !text.is_empty()
            && text.chars().count() < TAIL_MARKER_MAX_CHARS
            && markers.iter().any(|m| text.contains(m));
        if hit {
            if here as f64 > total as f64 * TAIL_START {
                nodes.truncate(i);
                return;
            }
            nodes.remove(i);
            continue;
        }
        cut_tail(&mut el.children, markers, total, position);
        i += 1;
    }
}

pub(crate) fn resolve_images(nodes: &mut Vec<Node>, ctx: &PassContext<'_>) -> Result<(), SanitizeError> {
    if ctx.origin == Origin::Singtao {
        lightbox_images(nodes);
    }
    for_each_element(nodes, &mut |el| {
        if el.tag != "img" {
            return;
        }
        match choose_source(el, ctx.link) {
            Some(src) => {
                el.set_attr("src", src);
                for attr in ["srcset", "data-srcset", "data-src", "data-original"] {
                    el.remove_attr(attr);
                }
            }
            None => el.remove_attr("src"),
        }
    });

    let noise = non_empty(&ctx.rules.noise_images);
    remove_where(nodes, &|el| {
        el.tag == "img"
            && el.attr("src").is_none_or(|src| {
                !src.starts_with(LOCAL_PREFIX)
                    && (is_noise_image(src) || noise.iter().any(|n| src.contains(n)))
            })
    });
    Ok(())
}

/// Lightbox anchors pointing at full-size photos get the photo as a child.
fn lightbox_images(nodes: &mut [Node]) {
    for_each_element(nodes, &mut |el| {
        if el.tag != "a" || el.contains_img() {
            return;
        }
        let Some(href) = el.attr("href").filter(|h| h.contains("image.hkhl.hk")) else {
            return;
        };
        let mut img = Element::new("img");
        img.set_attr("src", href.trim());
        if let Some(caption) = el.attr("data-caption").filter(|c| !c.trim().is_empty()) {
            img.set_attr("alt", caption);
        }
        el.children.push(Node::Element(img));
    });
}

fn first_srcset_candidate(srcset: &str) -> Option<&str> {
    srcset.split(',').next()?.split_whitespace().next()
}

/// The first usable image reference, resolved against `link`.
fn choose_source(img: &Element, link: &str) -> Option<String> {
    let src = img.attr("src").unwrap_or_default().trim();
    if src.starts_with(LOCAL_PREFIX) {
        return Some(src.to_string());
    }
    let usable =
        |c: &str| !c.is_empty() && !is_placeholder_src(c) && !is_generic_image(c, Some(link));
    let candidate = Some(src)
        .filter(|s| usable(s))
        .or_else(|| {
            ["srcset", "data-srcset"]
                .iter()
                .filter_map(|attr| img.attr(attr))
                .filter_map(first_srcset_candidate)
                .find(|c| usable(c))
        })
        .or_else(|| {
            ["data-src", "data-original"]
                .iter()
                .filter_map(|attr| img.attr(attr))
                .map(str::trim)
                .find(|c| usable(c))
        })?;
    let resolved = resolve_image_url(link, candidate);
    (!resolved.is_empty()).then_some(resolved)
}

pub(crate) fn links(nodes: &mut Vec<Node>, ctx: &PassContext<'_>) -> Result<(), SanitizeError> {
    if LINKLESS_ORIGINS.contains(&ctx.origin) {
        unwrap_where(nodes, &|el| el.tag == "a");
        return Ok(());
    }
    let base = Url::parse(ctx.link).ok();
    let absolute = |href: &str| -> Option<String> {
        let href = href.trim();
        let url = match &base {
            Some(base) => base.join(href).ok()?,
            None => Url::parse(href).ok()?,
        };
        matches!(url.scheme(), "http" | "https").then(|| url.to_string())
    };

    unwrap_where(nodes, &|el| {
        el.tag == "a" && el.attr("href").and_then(|href| absolute(href)).is_none()
    });
    for_each_element(nodes, &mut |el| {
        if el.tag != "a" {
            return;
        }
        if let Some(href) = el.attr("href").and_then(|href| absolute(href)) {
            el.set_attr("href", href);
            el.set_attr("target", "_blank");
            el.set_attr("rel", "noopener");
        }
    });
    Ok(())
}

/// Repeated paragraphs and repeated photos, for origins that syndicate the
/// same body twice or show a photo in several sizes.
pub(crate) fn dedupe(nodes: &mut Vec<Node>, ctx: &PassContext<'_>) -> Result<(), SanitizeError> {
    dedupe_paragraphs(nodes, &mut HashSet::new());
    let singtao = ctx.origin == Origin::Singtao;
    dedupe_images(nodes, &mut HashSet::new(), &|src| {
        let src = if singtao {
            SINGTAO_RESIZE_RE.replace_all(src, "/").into_owned()
        } else {
            src.to_string()
        };
        image_file_name(&src)
    });
    Ok(())
}

fn paragraph_key(text: &str) -> String {
    NON_WORD_RE.replace_all(text.trim(), "").to_lowercase()
}

fn dedupe_paragraphs(nodes: &mut Vec<Node>, seen: &mut HashSet<String>) {
    nodes.retain_mut(|node| match node {
        Node::Element(el) if el.tag == "p" => {
            let key = paragraph_key(&el.text());
            key.is_empty() || seen.insert(key)
        }
        Node::Element(el) => {
            dedupe_paragraphs(&mut el.children, seen);
            true
        }
        Node::Text(_) => true,
    });
}

fn dedupe_images(nodes: &mut Vec<Node>, seen: &mut HashSet<String>, key: &impl Fn(&str) -> String) {
    nodes.retain_mut(|node| match node {
        Node::Element(el) if el.tag == "img" => {
            let name = key(el.attr("src").unwrap_or_default());
            name.chars().count() < MIN_FILE_NAME_CHARS || seen.insert(name)
        }
        Node::Element(el) => {
            dedupe_images(&mut el.children, seen, key);
            true
        }
        Node::Text(_) => true,
    });
}

/// Remove leading body images that repeat the hero image.
///
/// Every leading copy goes, whatever its query string, so the first image
/// left behind never matches the hero.
pub(crate) fn drop_hero_duplicate(nodes: &mut Vec<Node>, ctx: &PassContext<'_>) -> Result<(), SanitizeError> {
    let Some(hero) = ctx.hero_image else {
        return Ok(());
    };
    let hero_name = image_file_name(hero);
    if hero_name.chars().count() <= MIN_FILE_NAME_CHARS {
        return Ok(());
    }
    while image_sources(nodes)
        .first()
        .is_some_and(|src| image_file_name(src) == hero_name)
    {
        if !remove_first_img(nodes) {
            break;
        }
    }
    Ok(())
}

fn remove_first_img(nodes: &mut Vec<Node>) -> bool {
    for i in 0..nodes.len() {
        if let Node::Element(el) = &mut nodes[i] {
            if el.tag == "img" {
                nodes.remove(i);
                return true;
            }
            if remove_first_img(&mut el.children) {
                return true;
            }
        }
    }
    false
}

pub(crate) fn prune(nodes: &mut Vec<Node>, ctx: &PassContext<'_>) -> Result<(), SanitizeError> {
    match ctx.origin {
        Origin::CnBeta => cnbeta_junk(nodes),
        Origin::Hk01 => {
            remove_where(nodes, &|el| el.tag == "br");
            remove_where(nodes, &|el| {
                matches!(el.tag.as_str(), "p" | "div" | "section" | "span")
                    && !el.contains_img()
                    && el.text().trim().is_empty()
            });
        }
        _ => {}
    }
    prune_empty(nodes);
    if ctx.origin == Origin::CnBeta {
        trim_trailing_blocks(nodes);
    }
    Ok(())
}

fn prune_empty(nodes: &mut Vec<Node>) {
    for node in nodes.iter_mut() {
        if let Node::Element(el) = node {
            prune_empty(&mut el.children);
        }
    }
    nodes.retain(|node| !matches!(node, Node::Element(el) if !el.is_void() && el.children.is_empty()));
}

fn strip_private_use(nodes: &mut [Node]) {
    for node in nodes {
        match node {
            Node::Text(text) => text.retain(|c| !('\u{e000}'..='\u{f8ff}').contains(&c)),
            Node::Element(el) => strip_private_use(&mut el.children),
        }
    }
}

fn cnbeta_junk(nodes: &mut Vec<Node>) {
    strip_private_use(nodes);
    remove_where(nodes, &|el| {
        if el.tag == "img" {
            let src = el.attr("src").unwrap_or_default().to_lowercase();
            return src.is_empty() || CNBETA_BROKEN_IMAGE_KEYS.iter().any(|k| src.contains(k));
        }
        if !CNBETA_JUNK_TAGS.contains(&el.tag.as_str()) || el.contains_img() {
            return false;
        }
        let text = el.text();
        let text = text.trim();
        text.chars().count() <= 3
            && (!WORD_RE.is_match(text) || CNBETA_SHARE_FRAGMENTS.contains(&text))
    });
}

/// Drop trailing image-only or near-empty blocks, descending into a
/// trailing wrapper that still holds real text.
fn trim_trailing_blocks(nodes: &mut Vec<Node>) {
    loop {
        while matches!(nodes.last(), Some(Node::Text(text)) if text.trim().is_empty()) {
            nodes.pop();
        }
        let Some(Node::Element(last)) = nodes.last_mut() else {
            return;
        };
        let chars = last.text().trim().chars().count();
        let trailing = matches!(last.tag.as_str(), "figure" | "img" | "div" | "span" | "p");
        let wrapper = matches!(last.tag.as_str(), "div" | "article" | "section");
        if chars > 10 || !trailing {
            if wrapper {
                trim_trailing_blocks(&mut last.children);
            }
            return;
        }
        if last.contains_img() || chars < 5 {
            nodes.pop();
            continue;
        }
        return;
    }
}
