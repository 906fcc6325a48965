//! HK01 article bodies rebuilt from the Next.js state embedded in the page.
//!
//! The rendered `<article>` markup is full of ad slots and lazy widgets, while
//! `__NEXT_DATA__` carries the same article as a list of typed blocks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static NEXT_DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<script[^>]*id=["']__NEXT_DATA__["'][^>]*>(.*?)</script>"#).unwrap()
});
static IMAGE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://\S+\.(jpe?g|png|gif|webp)(\?\S*)?$").unwrap());

/// Keys whose string values are image URLs inside image and gallery blocks.
const IMAGE_KEYS: &[&str] = &["cdnurl", "url", "src", "image", "originalimage", "mainimage"];

/// Replayed article body and every image it references.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Replay {
    pub content: String,
    pub images: Vec<String>,
}

/// Replay the largest `blocks` list found in the page's `__NEXT_DATA__`.
///
/// Returns `None` when the script is missing, is not JSON, or yields no
/// renderable block.
pub(crate) fn replay_blocks(page: &str) -> Option<Replay> {
    let raw = NEXT_DATA_RE.captures(page)?.get(1)?.as_str();
    let data: Value = serde_json::from_str(raw).ok()?;
    let blocks = largest_blocks(&data)?;

    let mut replay = Replay::default();
    for block in blocks {
        render_block(block, &mut replay);
    }
    (!replay.content.is_empty()).then_some(replay)
}

fn largest_blocks(value: &Value) -> Option<&Vec<Value>> {
    let mut best: Option<&Vec<Value>> = None;
    let mut stack = vec![value];
    while let Some(node) = stack.pop() {
        match node {
            Value::Object(map) => {
                if let Some(Value::Array(blocks)) = map.get("blocks") {
                    if best.is_none_or(|b| blocks.len() > b.len()) {
                        best = Some(blocks);
                    }
                }
                stack.extend(map.values());
            }
            Value::Array(items) => stack.extend(items),
            _ => {}
        }
    }
    best.filter(|blocks| !blocks.is_empty())
}

fn block_type(block: &Value) -> String {
    block
        .get("type")
        .or_else(|| block.get("blockType"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn render_block(block: &Value, out: &mut Replay) {
    match block_type(block).as_str() {
        "text" | "paragraph" | "htmltokens" => {
            let text = block_text(block);
            if !text.trim().is_empty() {
                out.content.push_str(&format!("<p>{}</p>", escape(&text)));
            }
        }
        "summary" | "subheading" | "heading" => {
            let text = block_text(block);
            if !text.trim().is_empty() {
                out.content.push_str(&format!("<h3>{}</h3>", escape(&text)));
            }
        }
        "image" => {
            if let Some(url) = block_images(block).into_iter().next() {
                let caption = block
                    .get("caption")
                    .or_else(|| block.pointer("/image/caption"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                push_figure(out, url, caption);
            }
        }
        "gallery" => {
            for url in block_images(block) {
                push_figure(out, url, "");
            }
        }
        _ => {}
    }
}

fn push_figure(out: &mut Replay, url: String, caption: &str) {
    out.content.push_str(&format!(r#"<figure><img src="{}">"#, escape(&url)));
    if !caption.trim().is_empty() {
        out.content
            .push_str(&format!("<figcaption>{}</figcaption>", escape(caption.trim())));
    }
    out.content.push_str("</figure>");
    if !out.images.contains(&url) {
        out.images.push(url);
    }
}

/// Text of a block: `htmlTokens` contents, else a `text` or `summary` field,
/// looked up on the block and on its `data` object.
fn block_text(block: &Value) -> String {
    let data = block.get("data");
    let tokens = block
        .get("htmlTokens")
        .or_else(|| data.and_then(|d| d.get("htmlTokens")))
        .and_then(Value::as_array);
    if let Some(tokens) = tokens {
        let mut parts = Vec::new();
        collect_token_content(tokens, &mut parts);
        if !parts.is_empty() {
            return parts.concat();
        }
    }
    ["text", "summary", "content"]
        .iter()
        .find_map(|key| {
            block
                .get(key)
                .or_else(|| data.and_then(|d| d.get(key)))
                .and_then(Value::as_str)
        })
        .unwrap_or_default()
        .to_string()
}

fn collect_token_content(tokens: &[Value], parts: &mut Vec<String>) {
    for token in tokens {
        match token {
            Value::Array(nested) => collect_token_content(nested, parts),
            Value::Object(map) => {
                if let Some(content) = map.get("content").and_then(Value::as_str) {
                    parts.push(content.to_string());
                }
            }
            _ => {}
        }
    }
}

/// Image URLs under a block, in document order.
fn block_images(block: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_images(block, &mut found);
    let mut seen = std::collections::HashSet::new();
    found.retain(|url| seen.insert(url.clone()));
    found
}

fn collect_images(value: &Value, acc: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match child {
                    Value::String(s)
                        if IMAGE_KEYS.contains(&key.to_ascii_lowercase().as_str())
                            && IMAGE_URL_RE.is_match(s) =>
                    {
                        acc.push(s.clone());
                    }
                    Value::Object(_) | Value::Array(_) => collect_images(child, acc),
                    _ => {}
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_images(item, acc)),
        _ => {}
    }
}

fn escape(text: &str) -> String {
    html_escape::encode_double_quoted_attribute(text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(json: &str) -> String {
        format!(
            r#"<html><body><script id="__NEXT_DATA__" type="application/json">{json}</script></body></html>"#
        )
    }

    #[test]
    fn test_replay_preserves_block_order() {
        let json = r#"{"props":{"pageProps":{
          "teaser":{"blocks":[{"type":"text","data":{"text":"teaser only"}}]},
          "article":{"blocks":[
            {"blockType":"summary","summary":"重點摘要"},
            {"type":"text","htmlTokens":[[{"type":"text","content":"第一段"},{"type":"text","content":"續"}]]},
            {"type":"image","image":{"cdnUrl":"https://cdn.hk01.com/di/media/images/1.jpg","caption":"圖說"}},
            {"type":"ad","data":{"text":"廣告"}},
            {"type":"gallery","images":[
              {"cdnUrl":"https://cdn.hk01.com/di/media/images/2.jpg"},
              {"cdnUrl":"https://cdn.hk01.com/di/media/images/3.jpg?v=1"}
            ]},
            {"type":"paragraph","data":{"text":"A < B"}}
          ]}
        }}}"#;
        let replay = replay_blocks(&page(json)).unwrap();
        assert_eq!(
            replay.content,
            concat!(
                "<h3>重點摘要</h3>",
                "<p>第一段續</p>",
                r#"<figure><img src="https://cdn.hk01.com/di/media/images/1.jpg"><figcaption>圖說</figcaption></figure>"#,
                r#"<figure><img src="https://cdn.hk01.com/di/media/images/2.jpg"></figure>"#,
                r#"<figure><img src="https://cdn.hk01.com/di/media/images/3.jpg?v=1"></figure>"#,
                "<p>A &lt; B</p>",
            )
        );
        assert_eq!(replay.images.len(), 3);
    }

    #[test]
    fn test_missing_or_malformed_state() {
        assert_eq!(replay_blocks("<html><article>x</article></html>"), None);
        assert_eq!(replay_blocks(&page("{not json")), None);
        assert_eq!(replay_blocks(&page(r#"{"blocks":[]}"#)), None);
        assert_eq!(replay_blocks(&page(r#"{"blocks":[{"type":"ad"}]}"#)), None);
    }
}
