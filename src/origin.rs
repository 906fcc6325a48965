//! Registry of known publishers.
//!
//! Every per-site decision in the crate (listing scrapers, request headers,
//! hotlink referers, extraction strategy, sanitization passes) dispatches on
//! an [`Origin`] resolved from a URL. Resolution is a substring match tried
//! in a fixed priority order with [`Origin::Generic`] as the fallback.

use std::fmt;

/// A publisher identified by domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Rthk,
    MingPao,
    Singtao,
    CnBeta,
    Hk01,
    OnCc,
    TheWitness,
    Hkepc,
    Unwire,
    NineToFiveMac,
    Generic,
}

/// Match table, tried top to bottom.
const MATCHERS: &[(&str, Origin)] = &[
    ("rthk.hk", Origin::Rthk),
    ("mingpao.com", Origin::MingPao),
    ("stheadline.com", Origin::Singtao),
    ("cnbeta", Origin::CnBeta),
    ("hk01.com", Origin::Hk01),
    ("on.cc", Origin::OnCc),
    ("thewitnesshk.com", Origin::TheWitness),
    ("hkepc.com", Origin::Hkepc),
    ("unwire.hk", Origin::Unwire),
    ("9to5mac.com", Origin::NineToFiveMac),
];

impl Origin {
    /// Resolve the origin of a link, source URL or image URL.
    pub fn from_url(url: &str) -> Origin {
        let lowered = url.to_ascii_lowercase();
        MATCHERS
            .iter()
            .find(|(needle, _)| lowered.contains(needle))
            .map(|(_, origin)| *origin)
            .unwrap_or(Origin::Generic)
    }

    /// Stable identifier used in records and configuration tables.
    pub fn name(self) -> &'static str {
        match self {
            Origin::Rthk => "rthk",
            Origin::MingPao => "mingpao",
            Origin::Singtao => "singtao",
            Origin::CnBeta => "cnbeta",
            Origin::Hk01 => "hk01",
            Origin::OnCc => "oncc",
            Origin::TheWitness => "thewitness",
            Origin::Hkepc => "hkepc",
            Origin::Unwire => "unwire",
            Origin::NineToFiveMac => "9to5mac",
            Origin::Generic => "generic",
        }
    }

    /// Referer that satisfies the origin's image hotlink protection, if it has one.
    pub fn image_referer(self) -> Option<&'static str> {
        match self {
            Origin::OnCc => Some("https://hk.on.cc/"),
            Origin::MingPao => Some("https://news.mingpao.com/"),
            Origin::Hk01 => Some("https://www.hk01.com/"),
            _ => None,
        }
    }

    /// Base used to absolutize links found on the origin's listing pages.
    pub fn listing_base(self) -> Option<&'static str> {
        match self {
            Origin::Hk01 => Some("https://www.hk01.com"),
            Origin::OnCc => Some("https://hk.on.cc"),
            Origin::TheWitness => Some("https://thewitnesshk.com/"),
            _ => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_matches_known_domains() {
        assert_eq!(
            Origin::from_url("https://news.rthk.hk/rthk/ch/component/k2/1.htm"),
            Origin::Rthk
        );
        assert_eq!(
            Origin::from_url("https://www.hk01.com/article/60313027"),
            Origin::Hk01
        );
        assert_eq!(
            Origin::from_url("https://rss.cnbeta.com.tw/rss"),
            Origin::CnBeta
        );
        assert_eq!(
            Origin::from_url("https://hk.on.cc/hk/bkn/cnt/news/20250116/x.html"),
            Origin::OnCc
        );
    }

    #[test]
    fn test_from_url_is_case_insensitive() {
        assert_eq!(Origin::from_url("HTTPS://UNWIRE.HK/2025/01/01/x"), Origin::Unwire);
    }

    #[test]
    fn test_unknown_domain_is_generic() {
        assert_eq!(Origin::from_url("https://example.com/a"), Origin::Generic);
        assert_eq!(Origin::from_url(""), Origin::Generic);
    }

    #[test]
    fn test_names_are_stable() {
        assert_eq!(Origin::NineToFiveMac.name(), "9to5mac");
        assert_eq!(Origin::Singtao.to_string(), "singtao");
    }

    #[test]
    fn test_image_referers() {
        assert_eq!(Origin::OnCc.image_referer(), Some("https://hk.on.cc/"));
        assert_eq!(Origin::Rthk.image_referer(), None);
    }
}
