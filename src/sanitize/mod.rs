//! Origin-aware cleaning of extracted article markup.
//!
//! The fragment is parsed once into an owned tree ([`dom`]) and a table of
//! passes runs over it in order. The table is keyed by [`Origin`]; every
//! origin shares the same order, and deduplication only runs for origins that
//! repeat paragraphs or photos.
//!
//! A synchronous pass runs on a copy of the tree and is discarded if it
//! fails. Input that cannot be parsed at all is returned unchanged. Running
//! the passes over their own output changes nothing.

pub mod dom;
mod passes;

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::config::{BoilerplateRules, Config};
use crate::fetch::Fetcher;
use crate::origin::Origin;
use crate::utils::image_cache_key;
use dom::{Node, for_each_element, image_sources, parse_fragment, serialize};
pub use passes::LOCAL_PREFIX;
use passes::PassContext;

#[derive(Debug, thiserror::Error)]
pub enum SanitizeError {
    #[error("unparsable fragment: {0}")]
    Unparsable(String),
    #[error("fragment nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("invalid boilerplate pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// One cleaning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    StripInteractive,
    StripBoilerplate,
    ResolveImages,
    Links,
    Dedupe,
    DropHeroDuplicate,
    /// Download images and point them at the local copies. Needs a fetcher.
    Localize,
    Prune,
}

type PassFn = fn(&mut Vec<Node>, &PassContext<'_>) -> Result<(), SanitizeError>;

const STANDARD_PASSES: &[Pass] = &[
    Pass::StripInteractive,
    Pass::StripBoilerplate,
    Pass::ResolveImages,
    Pass::Links,
    Pass::DropHeroDuplicate,
    Pass::Localize,
    Pass::Prune,
];

const DEDUPING_PASSES: &[Pass] = &[
    Pass::StripInteractive,
    Pass::StripBoilerplate,
    Pass::ResolveImages,
    Pass::Links,
    Pass::Dedupe,
    Pass::DropHeroDuplicate,
    Pass::Localize,
    Pass::Prune,
];

/// Passes for an origin, in execution order.
pub fn passes_for(origin: Origin) -> &'static [Pass] {
    match origin {
        Origin::CnBeta | Origin::Singtao => DEDUPING_PASSES,
        _ => STANDARD_PASSES,
    }
}

impl Pass {
    fn function(self) -> Option<PassFn> {
        match self {
            Pass::StripInteractive => Some(passes::strip_interactive),
            Pass::StripBoilerplate => Some(passes::strip_boilerplate),
            Pass::ResolveImages => Some(passes::resolve_images),
            Pass::Links => Some(passes::links),
            Pass::Dedupe => Some(passes::dedupe),
            Pass::DropHeroDuplicate => Some(passes::drop_hero_duplicate),
            Pass::Prune => Some(passes::prune),
            Pass::Localize => None,
        }
    }
}

/// Cleans fragments with the configured boilerplate rules, optionally
/// localizing images through a [`Fetcher`].
#[derive(Debug, Clone, Copy)]
pub struct Sanitizer<'a> {
    config: &'a Config,
    fetcher: Option<&'a Fetcher>,
}

impl<'a> Sanitizer<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            fetcher: None,
        }
    }

    /// Download body images and rewrite them to `images/<file>`.
    pub fn with_localizer(mut self, fetcher: &'a Fetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Clean `content` taken from `origin_link`.
    ///
    /// Returns the input unchanged when it cannot be parsed.
    pub async fn sanitize(&self, content: &str, origin_link: &str, hero_image: Option<&str>) -> String {
        let origin = Origin::from_url(origin_link);
        let rules = self.config.boilerplate_for(origin.name());
        let mut nodes = match parse_fragment(content) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(link = %origin_link, error = %e, "Leaving fragment unsanitized");
                return content.to_string();
            }
        };
        let ctx = PassContext {
            origin,
            link: origin_link,
            hero_image,
            rules: &rules,
        };

        for pass in passes_for(origin) {
            match pass.function() {
                Some(function) => run_guarded(*pass, function, &mut nodes, &ctx),
                None => {
                    if let Some(fetcher) = self.fetcher {
                        localize(&mut nodes, fetcher, origin_link).await;
                    }
                }
            }
        }
        serialize(&nodes)
    }

    /// Clean `content` without touching the network.
    pub fn clean(&self, content: &str, origin_link: &str, hero_image: Option<&str>) -> String {
        clean_with(
            content,
            origin_link,
            hero_image,
            &self.config.boilerplate_for(Origin::from_url(origin_link).name()),
        )
    }
}

/// Run every synchronous pass for the link's origin with explicit rules.
pub fn clean_with(
    content: &str,
    origin_link: &str,
    hero_image: Option<&str>,
    rules: &BoilerplateRules,
) -> String {
    let origin = Origin::from_url(origin_link);
    let mut nodes = match parse_fragment(content) {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(link = %origin_link, error = %e, "Leaving fragment unsanitized");
            return content.to_string();
        }
    };
    let ctx = PassContext {
        origin,
        link: origin_link,
        hero_image,
        rules,
    };
    for pass in passes_for(origin) {
        if let Some(function) = pass.function() {
            run_guarded(*pass, function, &mut nodes, &ctx);
        }
    }
    serialize(&nodes)
}

fn run_guarded(pass: Pass, function: PassFn, nodes: &mut Vec<Node>, ctx: &PassContext<'_>) {
    let mut working = nodes.clone();
    match function(&mut working, ctx) {
        Ok(()) => *nodes = working,
        Err(e) => warn!(?pass, link = %ctx.link, error = %e, "Pass failed; keeping previous tree"),
    }
}

/// Download every remote body image and point it at the local copy.
///
/// Images that fail to download keep their remote source.
async fn localize(nodes: &mut [Node], fetcher: &Fetcher, origin_link: &str) {
    // One download per cache key; query variants share the stored file.
    let mut by_key: BTreeMap<String, String> = BTreeMap::new();
    for src in image_sources(nodes) {
        if src.starts_with("http://") || src.starts_with("https://") {
            by_key.entry(image_cache_key(&src).to_string()).or_insert(src);
        }
    }

    let stored = join_all(
        by_key
            .values()
            .map(|src| fetcher.download_image(src, Some(origin_link))),
    )
    .await;
    let local: HashMap<&str, String> = by_key
        .keys()
        .map(String::as_str)
        .zip(stored)
        .filter_map(|(key, file)| Some((key, file?)))
        .collect();
    debug!(link = %origin_link, images = by_key.len(), localized = local.len(), "Localized images");

    for_each_element(nodes, &mut |el| {
        if el.tag != "img" {
            return;
        }
        if let Some(file) = el.attr("src").and_then(|src| local.get(image_cache_key(src))) {
            let path = format!("{LOCAL_PREFIX}{file}");
            el.set_attr("src", path);
        }
        el.set_attr("loading", "lazy");
        el.set_attr("decoding", "async");
    });
}
