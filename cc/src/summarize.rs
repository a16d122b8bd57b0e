//! Summarisation heuristics - the fast path
//!
//! A model-backed summariser exists upstream, but cards default to cheap
//! deterministic heuristics: short messages pass through unchanged, tool
//! results and structured values are compressed by shape, long prose is cut
//! at the first paragraph.

use serde_json::Value;

/// Messages at or below this length are used as their own summary
const SHORT_MESSAGE_CHARS: usize = 200;

/// Hard cap on any generated summary
const MAX_SUMMARY_CHARS: usize = 300;

/// Maximum keywords extracted per card
const MAX_KEYWORDS: usize = 20;

const STOPWORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "been", "will", "would", "could", "should", "there",
    "their", "about", "which", "these", "those", "were", "when", "what", "your", "into", "more",
    "some", "then", "than", "them", "they", "also", "only", "over", "such", "very", "each", "other",
    "after", "before", "because", "where", "while", "does", "done", "just", "like", "make", "made",
];

/// Produce a compact summary of a message's content.
pub fn summarize(content: &Value, role: &str) -> String {
    match content {
        Value::String(s) => summarize_text(s, role),
        Value::Object(_) => {
            if role == "tool" || looks_like_tool_result(content) {
                summarize_tool_result(content)
            } else {
                summarize_object(content)
            }
        }
        Value::Array(items) => format!("List of {} items", items.len()),
        Value::Null => String::new(),
        other => truncate(&other.to_string(), MAX_SUMMARY_CHARS),
    }
}

fn summarize_text(text: &str, _role: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= SHORT_MESSAGE_CHARS {
        return trimmed.to_string();
    }

    // First paragraph if it is a reasonable size, otherwise a hard cut
    if let Some(para) = trimmed.split("\n\n").next() {
        if para.len() <= MAX_SUMMARY_CHARS && para.len() >= 40 {
            return para.to_string();
        }
    }
    truncate(trimmed, MAX_SUMMARY_CHARS)
}

fn looks_like_tool_result(content: &Value) -> bool {
    content
        .as_object()
        .map(|o| o.contains_key("content") || o.contains_key("_route") || o.contains_key("status"))
        .unwrap_or(false)
}

fn summarize_tool_result(content: &Value) -> String {
    let obj = match content.as_object() {
        Some(o) => o,
        None => return truncate(&content.to_string(), MAX_SUMMARY_CHARS),
    };

    let mut parts = Vec::new();
    if let Some(status) = obj.get("status").and_then(|v| v.as_str()) {
        parts.push(format!("status={status}"));
    }
    if let Some(route) = obj.get("_route").and_then(|v| v.as_str()) {
        parts.push(format!("route={route}"));
    }
    if let Some(inner) = obj.get("content") {
        let text = match inner {
            Value::String(s) => truncate(s.trim(), 150),
            other => truncate(&other.to_string(), 150),
        };
        parts.push(text);
    }
    if parts.is_empty() {
        return summarize_object(content);
    }
    format!("Tool result: {}", parts.join(" "))
}

fn summarize_object(content: &Value) -> String {
    let obj = match content.as_object() {
        Some(o) => o,
        None => return truncate(&content.to_string(), MAX_SUMMARY_CHARS),
    };
    let keys: Vec<&str> = obj.keys().map(|k| k.as_str()).take(12).collect();
    format!("Structured data with keys: {}", keys.join(", "))
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Extract up to 20 keywords: alphanumeric words of 4+ chars, lowercased,
/// stopword-filtered, first-seen order.
pub fn extract_keywords(text: &str) -> Vec<String> {
    static WORD_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let word_re = WORD_RE.get_or_init(|| regex::Regex::new(r"[A-Za-z0-9_]{4,}").expect("static pattern"));
    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();

    for m in word_re.find_iter(text) {
        let word = m.as_str().to_lowercase();
        if STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        if seen.insert(word.clone()) {
            keywords.push(word);
            if keywords.len() >= MAX_KEYWORDS {
                break;
            }
        }
    }
    keywords
}

/// Rough token estimate: 1 token per 4 characters of serialized content.
pub fn estimate_tokens(content: &Value) -> usize {
    let len = match content {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    len.div_ceil(4)
}
