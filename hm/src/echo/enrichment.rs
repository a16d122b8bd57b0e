//! Helpers for enriching history entries before they reach the log sink

use serde_json::Value;

/// Detect base64-encoded image data anywhere in a content value.
///
/// Catches raw data URLs in strings, the multimodal
/// `{"type": "image_url", "image_url": {"url": "data:..."}}` shape in
/// arrays, and nests recursively through objects.
pub fn detect_base64_in_content(content: &Value) -> bool {
    match content {
        Value::String(s) => s.contains("data:image/") && s.contains(";base64,"),
        Value::Array(items) => items.iter().any(|item| {
            if item.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                item.pointer("/image_url/url")
                    .and_then(|u| u.as_str())
                    .map(|u| u.contains("data:image/") && u.contains(";base64,"))
                    .unwrap_or(false)
            } else {
                false
            }
        }),
        Value::Object(map) => map.values().any(detect_base64_in_content),
        _ => false,
    }
}

/// Extract image file paths from a tool result: `{"images": [...]}`
pub fn extract_image_paths(result: &Value) -> Vec<String> {
    extract_path_list(result, "images")
}

/// Extract audio file paths from a tool result: `{"audio": [...]}`
pub fn extract_audio_paths(result: &Value) -> Vec<String> {
    extract_path_list(result, "audio")
}

fn extract_path_list(result: &Value, key: &str) -> Vec<String> {
    match result.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}
