//! RSS 2.0 and Atom parsing.
//!
//! The document is first parsed strictly. Many publishers emit invalid XML
//! (bare ampersands, mismatched tags, raw HTML in descriptions), so on
//! failure the payload is repaired and every `<item>`/`<entry>` chunk is
//! parsed on its own with end-tag checking relaxed. Chunks that still fail
//! are dropped.

use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use tracing::debug;

use super::{DecodeError, RawEntry};

static ENTRY_CHUNK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<item\b[^>]*>.*?</item\s*>|<entry\b[^>]*>.*?</entry\s*>").unwrap()
});
static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[A-Za-z][A-Za-z0-9]*|#[0-9]+|#[xX][0-9A-Fa-f]+);").unwrap());
static IMG_SRC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img\b[^>]*\ssrc\s*=\s*["']([^"']+)["']"#).unwrap());
static IMG_DATA_SRC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img\b[^>]*\sdata-src\s*=\s*["']([^"']+)["']"#).unwrap());

/// A parsed XML element. Names are lowercased and keep their prefix.
#[derive(Debug, Default, Clone)]
pub(crate) struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    /// Direct text and CDATA content, entities resolved.
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn new(name: String, attrs: Vec<(String, String)>) -> Self {
        Self {
            name,
            attrs,
            ..Default::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Direct text, or the text of all descendants when there is none.
    pub fn text_content(&self) -> String {
        let own = self.text.trim();
        if !own.is_empty() {
            return own.to_string();
        }
        let mut out = String::new();
        self.collect_text(&mut out);
        out.trim().to_string()
    }

    fn collect_text(&self, out: &mut String) {
        out.push_str(&self.text);
        for child in &self.children {
            child.collect_text(out);
        }
    }

    /// Text of the first listed child that has any.
    fn first_text(&self, names: &[&str]) -> String {
        names
            .iter()
            .filter_map(|name| self.child(name))
            .map(XmlNode::text_content)
            .find(|text| !text.is_empty())
            .unwrap_or_default()
    }

    fn descendants_named<'a>(&'a self, names: &[&str], out: &mut Vec<&'a XmlNode>) {
        for child in &self.children {
            if names.contains(&child.name.as_str()) {
                out.push(child);
            } else {
                child.descendants_named(names, out);
            }
        }
    }
}

fn element(start: &BytesStart<'_>) -> XmlNode {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_lowercase();
    let attrs = start
        .attributes()
        .with_checks(false)
        .filter_map(|attr| attr.ok())
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_lowercase();
            let raw = String::from_utf8_lossy(&attr.value).into_owned();
            (key, html_escape::decode_html_entities(&raw).into_owned())
        })
        .collect();
    XmlNode::new(name, attrs)
}

/// Resolve a general entity reference body such as `amp` or `#x4E2D`.
fn resolve_reference(name: &str) -> String {
    html_escape::decode_html_entities(&format!("&{name};")).into_owned()
}

/// Parse a document into a synthetic root holding the top-level elements.
///
/// In strict mode any syntax error or mismatched end tag fails the parse.
/// Otherwise an end tag closes the nearest open element with that name and
/// stray end tags are ignored.
pub(crate) fn parse_tree(text: &str, strict: bool) -> Result<XmlNode, quick_xml::Error> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().check_end_names = strict;

    let mut stack = vec![XmlNode::new("#document".to_string(), Vec::new())];
    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(element(&start)),
            Event::Empty(start) => {
                let node = element(&start);
                if let Some(top) = stack.last_mut() {
                    top.children.push(node);
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::GeneralRef(r) => {
                let name = String::from_utf8_lossy(&r).into_owned();
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&resolve_reference(&name));
                }
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).to_lowercase();
                let open_at = stack.iter().rposition(|n| n.name == name).filter(|&i| i > 0);
                if let Some(index) = open_at {
                    while stack.len() > index {
                        close_top(&mut stack);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    while stack.len() > 1 {
        close_top(&mut stack);
    }
    Ok(stack.pop().unwrap_or_default())
}

fn close_top(stack: &mut Vec<XmlNode>) {
    if let Some(node) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(node);
        }
    }
}

/// Escape every `&` that does not start a character or entity reference.
pub(crate) fn escape_dangling_amps(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if REFERENCE_RE.is_match(after) {
            out.push('&');
        } else {
            out.push_str("&amp;");
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Parse an RSS or Atom document into raw entries.
pub(crate) fn parse(text: &str) -> Result<Vec<RawEntry>, DecodeError> {
    match parse_tree(text, true) {
        Ok(root) => Ok(entries_of(&root)),
        Err(e) => {
            debug!(error = %e, "Strict feed parse failed; retrying tolerantly");
            parse_tolerant(text)
        }
    }
}

fn parse_tolerant(text: &str) -> Result<Vec<RawEntry>, DecodeError> {
    let repaired = escape_dangling_amps(text);
    let chunks: Vec<&str> = ENTRY_CHUNK_RE
        .find_iter(&repaired)
        .map(|m| m.as_str())
        .collect();

    if chunks.is_empty() {
        return parse_tree(&repaired, false)
            .map(|root| entries_of(&root))
            .map_err(|e| DecodeError::Unparsable(e.to_string()));
    }

    let total = chunks.len();
    let entries: Vec<RawEntry> = chunks
        .into_iter()
        .filter_map(|chunk| match parse_tree(chunk, false) {
            Ok(root) => root.children.first().map(entry_from),
            Err(e) => {
                debug!(error = %e, "Dropping unparsable feed entry");
                None
            }
        })
        .collect();
    if entries.is_empty() {
        return Err(DecodeError::Unparsable(format!(
            "none of {total} entries could be parsed"
        )));
    }
    Ok(entries)
}

fn entries_of(root: &XmlNode) -> Vec<RawEntry> {
    let mut nodes = Vec::new();
    root.descendants_named(&["item", "entry"], &mut nodes);
    nodes.into_iter().map(entry_from).collect()
}

fn entry_from(node: &XmlNode) -> RawEntry {
    let summary = node.first_text(&["description", "content:encoded", "content", "summary"]);
    RawEntry {
        title: node.first_text(&["title"]),
        link: entry_link(node),
        published_text: node.first_text(&["pubdate", "published", "updated", "dc:date"]),
        published: None,
        image: entry_image(node),
        summary,
    }
}

/// `<link>` text, else an Atom `href` (alternate first), else a URL-shaped id.
fn entry_link(node: &XmlNode) -> String {
    let links: Vec<&XmlNode> = node.children.iter().filter(|c| c.name == "link").collect();
    if let Some(text) = links
        .iter()
        .map(|l| l.text_content())
        .find(|t| !t.is_empty())
    {
        return text;
    }
    let href = links
        .iter()
        .find(|l| l.attr("rel").is_none_or(|rel| rel == "alternate"))
        .or(links.first())
        .and_then(|l| l.attr("href"));
    if let Some(href) = href.filter(|h| !h.trim().is_empty()) {
        return href.to_string();
    }
    let id = node.first_text(&["guid", "id"]);
    if id.starts_with("http://") || id.starts_with("https://") || id.starts_with("//") {
        return id;
    }
    String::new()
}

/// Enclosure or media reference, then the first inline image in the markup.
fn entry_image(node: &XmlNode) -> Option<String> {
    let mut media = Vec::new();
    node.descendants_named(&["enclosure", "media:content", "media:thumbnail"], &mut media);
    let explicit = media
        .iter()
        .filter(|m| {
            m.name != "enclosure" || m.attr("type").is_none_or(|t| t.starts_with("image"))
        })
        .filter_map(|m| m.attr("url"))
        .map(str::trim)
        .find(|url| !url.is_empty());
    if let Some(url) = explicit {
        return Some(url.to_string());
    }

    let markup: Vec<String> = ["description", "content:encoded", "content", "summary"]
        .iter()
        .filter_map(|name| node.child(name))
        .map(XmlNode::text_content)
        .collect();
    for re in [&*IMG_SRC_RE, &*IMG_DATA_SRC_RE] {
        if let Some(url) = markup
            .iter()
            .find_map(|m| re.captures(m).map(|c| c[1].to_string()))
        {
            return Some(url);
        }
    }

    let mut imgs = Vec::new();
    node.descendants_named(&["img"], &mut imgs);
    imgs.iter()
        .find_map(|img| img.attr("src").or_else(|| img.attr("data-src")))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_dangling_amps() {
        assert_eq!(escape_dangling_amps("A & B"), "A &amp; B");
        assert_eq!(escape_dangling_amps("a &amp; b &#38; &#x26;"), "a &amp; b &#38; &#x26;");
        assert_eq!(escape_dangling_amps("x?a=1&b=2"), "x?a=1&amp;b=2");
        assert_eq!(escape_dangling_amps("trailing &"), "trailing &amp;");
    }

    #[test]
    fn test_strict_parse_resolves_entities_and_cdata() {
        let root = parse_tree(
            "<rss><item><title>Q&amp;A &#x4E2D;</title><description><![CDATA[<p>hi</p>]]></description></item></rss>",
            true,
        )
        .unwrap();
        let entries = entries_of(&root);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Q&A 中");
        assert_eq!(entries[0].summary, "<p>hi</p>");
    }

    #[test]
    fn test_unescaped_ampersand_uses_tolerant_fallback() {
        let feed = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title>
<item><title>Good entry</title><link>https://a.com/1</link></item>
<item><title>Tom & Jerry</title><link>https://a.com/2?x=1&y=2</link></item>
</channel></rss>"#;
        assert!(parse_tree(feed, true).is_err());
        let entries = parse(feed).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Good entry");
        assert_eq!(entries[1].title, "Tom & Jerry");
        assert_eq!(entries[1].link, "https://a.com/2?x=1&y=2");
    }

    #[test]
    fn test_broken_chunk_is_dropped() {
        let feed = r#"<rss><channel>
<item><title>Fine</title><link>https://a.com/1</link></item>
<item><title><![CDATA[never closed</title><link>https://a.com/2</link></item>
</channel></rss>"#;
        let entries = parse(feed).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].link, "https://a.com/1");
    }

    #[test]
    fn test_mismatched_tags_recovered() {
        let feed = "<rss><channel><item><title>Hi</title><description><p>para<br></description>\
                    <link>https://a.com/3</link></item></channel></rss>";
        let entries = parse(feed).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].link, "https://a.com/3");
        assert!(entries[0].summary.contains("para"));
    }

    #[test]
    fn test_garbage_is_unparsable() {
        assert!(matches!(
            parse("<rss><item><![CDATA[oops"),
            Err(DecodeError::Unparsable(_))
        ));
    }

    #[test]
    fn test_atom_links_and_dates() {
        let feed = r#"<feed xmlns="http://www.w3.org/2005/Atom">
<entry>
  <title type="html">Atom &lt;b&gt;entry&lt;/b&gt;</title>
  <link rel="self" href="https://a.com/self/1"/>
  <link rel="alternate" href="https://a.com/posts/1"/>
  <updated>2026-01-14T11:15:00+08:00</updated>
  <summary>Short</summary>
</entry>
<entry>
  <title>Id only</title>
  <id>https://a.com/posts/2</id>
  <published>2026-01-14T10:00:00Z</published>
</entry>
</feed>"#;
        let entries = parse(feed).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].link, "https://a.com/posts/1");
        assert_eq!(entries[0].published_text, "2026-01-14T11:15:00+08:00");
        assert_eq!(entries[0].title, "Atom <b>entry</b>");
        assert_eq!(entries[1].link, "https://a.com/posts/2");
    }

    #[test]
    fn test_image_priority() {
        let feed = r#"<rss xmlns:media="http://search.yahoo.com/mrss/"><channel>
<item><title>a</title><link>https://a.com/1</link>
  <description><![CDATA[<img src="/inline.jpg">]]></description>
  <media:content url="https://cdn.a.com/media.jpg" medium="image"/></item>
<item><title>b</title><link>https://a.com/2</link>
  <description><![CDATA[<p><img class="lazy" data-src="/lazy.jpg"></p>]]></description></item>
<item><title>c</title><link>https://a.com/3</link>
  <enclosure url="https://a.com/a.mp3" type="audio/mpeg"/></item>
</channel></rss>"#;
        let entries = parse(feed).unwrap();
        assert_eq!(entries[0].image.as_deref(), Some("https://cdn.a.com/media.jpg"));
        assert_eq!(entries[1].image.as_deref(), Some("/lazy.jpg"));
        assert_eq!(entries[2].image, None);
    }
}
