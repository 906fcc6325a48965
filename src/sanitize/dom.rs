//! Owned, mutable node tree for content fragments.
//!
//! `scraper` parses the fragment; the result is copied into plain owned
//! nodes so passes can remove, unwrap and rewrite freely and the tree can be
//! held across `.await` points.

use scraper::{ElementRef, Html};

use super::SanitizeError;

/// Nesting beyond this is treated as unparsable.
pub const MAX_DEPTH: usize = 512;

/// Elements serialized without a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(key, _)| key != name);
    }

    pub fn is_void(&self) -> bool {
        VOID_ELEMENTS.contains(&self.tag.as_str())
    }

    /// Whether the `class` attribute contains `fragment` as a substring.
    pub fn class_contains(&self, fragment: &str) -> bool {
        self.attr("class").is_some_and(|class| class.contains(fragment))
    }

    /// All descendant text.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }

    /// Text of direct text children only.
    pub fn own_text(&self) -> String {
        self.children
            .iter()
            .filter_map(|child| match child {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    pub fn contains_img(&self) -> bool {
        self.tag == "img"
            || self.children.iter().any(|child| match child {
                Node::Element(el) => el.contains_img(),
                Node::Text(_) => false,
            })
    }
}

fn collect_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => collect_text(&el.children, out),
        }
    }
}

/// Parse a fragment into owned top-level nodes. Comments are dropped.
///
/// # Errors
///
/// [`SanitizeError::TooDeep`] past [`MAX_DEPTH`], and
/// [`SanitizeError::Unparsable`] when non-blank input yields no nodes.
pub fn parse_fragment(fragment: &str) -> Result<Vec<Node>, SanitizeError> {
    let html = Html::parse_fragment(fragment);
    let nodes = convert_children(html.root_element(), 0)?;
    if nodes.is_empty() && !fragment.trim().is_empty() {
        return Err(SanitizeError::Unparsable(
            "fragment produced no nodes".to_string(),
        ));
    }
    Ok(nodes)
}

fn convert_children(parent: ElementRef<'_>, depth: usize) -> Result<Vec<Node>, SanitizeError> {
    if depth > MAX_DEPTH {
        return Err(SanitizeError::TooDeep(MAX_DEPTH));
    }
    let mut nodes = Vec::new();
    for child in parent.children() {
        if let Some(element) = ElementRef::wrap(child) {
            let value = element.value();
            nodes.push(Node::Element(Element {
                tag: value.name().to_ascii_lowercase(),
                attrs: value
                    .attrs()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
                children: convert_children(element, depth + 1)?,
            }));
        } else if let Some(text) = child.value().as_text() {
            nodes.push(Node::Text(text.to_string()));
        }
    }
    Ok(nodes)
}

/// Serialize nodes back into markup.
pub fn serialize(nodes: &[Node]) -> String {
    let mut out = String::new();
    write_nodes(nodes, &mut out);
    out
}

fn write_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(&html_escape::encode_text(text)),
            Node::Element(el) => {
                out.push('<');
                out.push_str(&el.tag);
                for (key, value) in &el.attrs {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(&html_escape::encode_double_quoted_attribute(value));
                    out.push('"');
                }
                out.push('>');
                if el.is_void() {
                    continue;
                }
                write_nodes(&el.children, out);
                out.push_str("</");
                out.push_str(&el.tag);
                out.push('>');
            }
        }
    }
}

/// Visit every element, parents before children.
pub fn for_each_element(nodes: &mut [Node], f: &mut impl FnMut(&mut Element)) {
    for node in nodes {
        if let Node::Element(el) = node {
            f(el);
            for_each_element(&mut el.children, f);
        }
    }
}

/// Remove every element (with its subtree) for which `doomed` returns true.
///
/// Surviving elements are descended into.
pub fn remove_where(nodes: &mut Vec<Node>, doomed: &impl Fn(&Element) -> bool) {
    nodes.retain(|node| !matches!(node, Node::Element(el) if doomed(el)));
    for node in nodes.iter_mut() {
        if let Node::Element(el) = node {
            remove_where(&mut el.children, doomed);
        }
    }
}

/// Replace every element for which `unwrap` returns true with its children.
pub fn unwrap_where(nodes: &mut Vec<Node>, unwrap: &impl Fn(&Element) -> bool) {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes.drain(..) {
        match node {
            Node::Element(mut el) => {
                unwrap_where(&mut el.children, unwrap);
                if unwrap(&el) {
                    out.extend(el.children);
                } else {
                    out.push(Node::Element(el));
                }
            }
            text => out.push(text),
        }
    }
    *nodes = out;
}

/// Sources of every `img`, in document order.
pub fn image_sources(nodes: &[Node]) -> Vec<String> {
    let mut out = Vec::new();
    collect_sources(nodes, &mut out);
    out
}

fn collect_sources(nodes: &[Node], out: &mut Vec<String>) {
    for node in nodes {
        if let Node::Element(el) = node {
            if el.tag == "img" {
                if let Some(src) = el.attr("src") {
                    out.push(src.to_string());
                }
            }
            collect_sources(&el.children, out);
        }
    }
}
