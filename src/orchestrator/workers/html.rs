//! Lightweight HTML summarization for scraped pages.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"));
static META_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\s[^>]*>").expect("valid meta regex"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid attribute regex")
});
static HIDDEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|template|svg)\b[^>]*>.*?</(script|style|noscript|template|svg)>|<!--.*?-->")
        .expect("valid hidden-block regex")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid space regex"));

/// Extracted content of one page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSummary {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub text: String,
    pub word_count: usize,
}

/// Pull the title, meta description and visible text out of `html`.
/// `text` is cut at `max_text_chars` characters; `word_count` covers the
/// whole page.
pub fn summarize_page(url: &str, html: &str, max_text_chars: usize) -> PageSummary {
    let title = TITLE_RE
        .captures(html)
        .map(|c| clean(&c[1]))
        .filter(|t| !t.is_empty());

    let description = META_RE
        .find_iter(html)
        .filter_map(|m| {
            let mut name = None;
            let mut content = None;
            for attr in ATTR_RE.captures_iter(m.as_str()) {
                let value = attr.get(2).or_else(|| attr.get(3)).map(|v| v.as_str());
                match attr[1].to_ascii_lowercase().as_str() {
                    "name" | "property" => name = value.map(str::to_ascii_lowercase),
                    "content" => content = value,
                    _ => {}
                }
            }
            match name.as_deref() {
                Some("description") | Some("og:description") => content.map(clean),
                _ => None,
            }
        })
        .find(|d| !d.is_empty());

    let visible = HIDDEN_RE.replace_all(html, " ");
    let visible = TITLE_RE.replace_all(&visible, " ");
    let text = clean(&TAG_RE.replace_all(&visible, " "));
    let word_count = text.split_whitespace().count();
    let text = match text.char_indices().nth(max_text_chars) {
        Some((cut, _)) => text[..cut].trim_end().to_string(),
        None => text,
    };

    PageSummary {
        url: url.to_string(),
        title,
        description,
        text,
        word_count,
    }
}

fn clean(raw: &str) -> String {
    let decoded = raw
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&");
    SPACE_RE.replace_all(decoded.trim(), " ").into_owned()
}
