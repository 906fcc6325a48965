//! Static per-origin extraction table.

use crate::origin::Origin;

/// Where to read image URLs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLocator {
    pub selector: &'static str,
    /// Attributes read from each match, in order.
    pub attrs: &'static [&'static str],
}

/// Extra image source scanned from the raw page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supplement {
    /// Every `newsstatic.rthk.hk` large photo, prepended as figures.
    RthkNewsstatic,
    /// Every `static.cnbetacdn.com` image, appended as figures.
    CnBetaCdn,
}

/// How to pull the article body and images out of one origin's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub origin: Origin,
    /// Content selectors tried in order; the first non-empty match wins.
    pub content: &'static [&'static str],
    /// Empty means "every `img[src]` inside the content node".
    pub images: &'static [ImageLocator],
    pub supplement: Option<Supplement>,
    /// Put the first structural image at the top of the content.
    pub lead_figure: bool,
    /// Expand `<gallery-*>` placeholders from the `article_galleries` script.
    pub galleries: bool,
    /// Rebuild the body from the typed blocks in `__NEXT_DATA__`.
    pub next_data_blocks: bool,
}

const SRC: &[&str] = &["src"];
const LAZY_SRC: &[&str] = &["src", "data-src", "data-original"];
const HREF: &[&str] = &["href"];

const GENERIC_CONTENT: &[&str] = &["article", "div[class*=content]"];

const GENERIC: Strategy = Strategy {
    origin: Origin::Generic,
    content: GENERIC_CONTENT,
    images: &[],
    supplement: None,
    lead_figure: false,
    galleries: false,
    next_data_blocks: false,
};

const RTHK: Strategy = Strategy {
    origin: Origin::Rthk,
    content: &["div[class*=itemFullText]"],
    images: &[
        ImageLocator { selector: "div[class*=itemImage] img", attrs: LAZY_SRC },
        ImageLocator { selector: "div[class*=videoDisplay] img", attrs: LAZY_SRC },
        ImageLocator { selector: "div[class*=img-slide-wrap] img", attrs: LAZY_SRC },
    ],
    supplement: Some(Supplement::RthkNewsstatic),
    lead_figure: true,
    ..GENERIC
};

const MINGPAO: Strategy = Strategy {
    origin: Origin::MingPao,
    content: &[
        "div#blockcontent article[class*=txt4]",
        "article[class*=txt4]",
        "div#upper",
        "div[class*=article_content]",
    ],
    images: &[
        ImageLocator { selector: "a[class*=fancybox-buttons]", attrs: HREF },
        ImageLocator { selector: "div[class*=gallery_wrapper] img", attrs: SRC },
        ImageLocator { selector: "figure img", attrs: SRC },
    ],
    ..GENERIC
};

const SINGTAO: Strategy = Strategy {
    origin: Origin::Singtao,
    content: &[
        "div[class*=article-content]",
        "div[class*=main-body]",
        "div[class*=content-main]",
    ],
    images: &[
        ImageLocator { selector: "a[class*=gallery-item]", attrs: HREF },
        ImageLocator { selector: "div[class*=std-slider] img", attrs: SRC },
        ImageLocator { selector: "figure img", attrs: SRC },
    ],
    galleries: true,
    ..GENERIC
};

const CNBETA: Strategy = Strategy {
    origin: Origin::CnBeta,
    content: &["div#article_content", "div[class*=article-content]"],
    images: &[
        ImageLocator { selector: "div#article_content img", attrs: SRC },
        ImageLocator { selector: "article img", attrs: SRC },
    ],
    supplement: Some(Supplement::CnBetaCdn),
    lead_figure: true,
    ..GENERIC
};

const HK01: Strategy = Strategy {
    origin: Origin::Hk01,
    content: &["article"],
    images: &[ImageLocator { selector: "article img", attrs: SRC }],
    next_data_blocks: true,
    ..GENERIC
};

const THEWITNESS: Strategy = Strategy {
    origin: Origin::TheWitness,
    content: &["div[class*=entry-content]", "article"],
    images: &[
        ImageLocator { selector: "div[class*=entry-content] img", attrs: SRC },
        ImageLocator { selector: "figure img", attrs: SRC },
    ],
    ..GENERIC
};

const HKEPC: Strategy = Strategy {
    origin: Origin::Hkepc,
    content: &["div#view", "div[class*=article-content]"],
    ..GENERIC
};

const UNWIRE: Strategy = Strategy {
    origin: Origin::Unwire,
    content: &["div[class*=entry-content]", "div[class*=post-content]"],
    ..GENERIC
};

/// Strategy for an article link.
pub fn select_strategy(link: &str) -> Strategy {
    match Origin::from_url(link) {
        Origin::Rthk => RTHK,
        Origin::MingPao => MINGPAO,
        Origin::Singtao => SINGTAO,
        Origin::CnBeta => CNBETA,
        Origin::Hk01 => HK01,
        Origin::TheWitness => THEWITNESS,
        Origin::Hkepc => HKEPC,
        Origin::Unwire => UNWIRE,
        origin @ (Origin::OnCc | Origin::NineToFiveMac | Origin::Generic) => {
            Strategy { origin, ..GENERIC }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Selector;

    #[test]
    fn test_select_strategy() {
        let rthk = select_strategy("https://news.rthk.hk/rthk/ch/component/k2/1.htm");
        assert_eq!(rthk.origin, Origin::Rthk);
        assert_eq!(rthk.supplement, Some(Supplement::RthkNewsstatic));
        assert!(rthk.lead_figure);

        assert!(select_strategy("https://www.stheadline.com/realtime/1").galleries);
        assert!(select_strategy("https://www.hk01.com/article/1").next_data_blocks);

        let other = select_strategy("https://hk.on.cc/hk/bkn/cnt/news/1.html");
        assert_eq!(other.origin, Origin::OnCc);
        assert_eq!(other.content, GENERIC_CONTENT);
    }

    #[test]
    fn test_every_selector_parses() {
        for strategy in [RTHK, MINGPAO, SINGTAO, CNBETA, HK01, THEWITNESS, HKEPC, UNWIRE, GENERIC] {
            for selector in strategy.content {
                assert!(Selector::parse(selector).is_ok(), "{selector}");
            }
            for locator in strategy.images {
                assert!(Selector::parse(locator.selector).is_ok(), "{}", locator.selector);
            }
        }
    }
}
