//! Outbound message sanitation
//!
//! History entries accumulate trace fields (`trace_id`, `parent_id`,
//! `node_type`, `metadata`) that providers reject. Only the wire-legal
//! fields survive sanitation, and the allowed set shrinks further when
//! tools are emulated in-prompt rather than called natively.

use serde_json::{Map, Value};
use tracing::warn;

const NATIVE_FIELDS: &[&str] = &["role", "content", "tool_calls", "tool_call_id", "name"];
const PROMPT_FIELDS: &[&str] = &["role", "content", "name"];

/// Clean a message history for the provider.
///
/// - keeps only wire-legal fields (`tool_calls`/`tool_call_id` only in
///   native mode)
/// - skips `role: tool` messages entirely in prompt mode
/// - drops messages with empty content unless they carry tool calls
pub fn sanitize_messages(messages: &[Value], use_native_tools: bool) -> Vec<Value> {
    let allowed: &[&str] = if use_native_tools { NATIVE_FIELDS } else { PROMPT_FIELDS };

    let mut sanitized = Vec::with_capacity(messages.len());
    for message in messages {
        let map = match message.as_object() {
            Some(map) => map,
            None => continue,
        };

        if !use_native_tools && map.get("role").and_then(|r| r.as_str()) == Some("tool") {
            warn!("sanitize_messages: skipping role=tool message in prompt-based mode");
            continue;
        }

        let mut clean = Map::new();
        for &field in allowed {
            match map.get(field) {
                // Null tool_calls would be rejected by providers
                Some(Value::Null) if field == "tool_calls" => continue,
                Some(value) => {
                    clean.insert(field.to_string(), value.clone());
                }
                None => {}
            }
        }

        let has_content = clean
            .get("content")
            .map(|c| match c {
                Value::String(s) => !s.is_empty(),
                Value::Null => false,
                _ => true,
            })
            .unwrap_or(false);
        let has_tool_calls = clean.get("tool_calls").map(|t| !t.is_null()).unwrap_or(false);

        if !has_content && !has_tool_calls {
            warn!(role = ?map.get("role"), "sanitize_messages: skipping empty message");
            continue;
        }

        sanitized.push(Value::Object(clean));
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trace_fields_stripped() {
        let messages = vec![json!({
            "role": "user",
            "content": "hello",
            "trace_id": "t-1",
            "parent_id": "t-0",
            "node_type": "turn_input",
            "metadata": {"phase_name": "draft"}
        })];

        let clean = sanitize_messages(&messages, true);
        assert_eq!(clean.len(), 1);
        let map = clean[0].as_object().unwrap();
        assert!(map.contains_key("role"));
        assert!(map.contains_key("content"));
        assert!(!map.contains_key("trace_id"));
        assert!(!map.contains_key("parent_id"));
        assert!(!map.contains_key("node_type"));
        assert!(!map.contains_key("metadata"));
    }

    #[test]
    fn test_prompt_mode_strips_tool_fields() {
        let messages = vec![json!({
            "role": "assistant",
            "content": "calling a tool",
            "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "f", "arguments": "{}"}}]
        })];

        let native = sanitize_messages(&messages, true);
        assert!(native[0].get("tool_calls").is_some());

        let prompt = sanitize_messages(&messages, false);
        assert!(prompt[0].get("tool_calls").is_none());
    }

    #[test]
    fn test_prompt_mode_skips_tool_role() {
        let messages = vec![
            json!({"role": "tool", "tool_call_id": "c1", "content": "result"}),
            json!({"role": "user", "content": "next"}),
        ];

        let prompt = sanitize_messages(&messages, false);
        assert_eq!(prompt.len(), 1);
        assert_eq!(prompt[0]["role"], "user");

        let native = sanitize_messages(&messages, true);
        assert_eq!(native.len(), 2);
    }

    #[test]
    fn test_empty_content_dropped_unless_tool_calls() {
        let messages = vec![
            json!({"role": "assistant", "content": ""}),
            json!({"role": "assistant", "content": "", "tool_calls": [{"id": "c", "type": "function", "function": {"name": "f", "arguments": "{}"}}]}),
        ];

        let clean = sanitize_messages(&messages, true);
        assert_eq!(clean.len(), 1);
        assert!(clean[0].get("tool_calls").is_some());
    }

    #[test]
    fn test_null_tool_calls_dropped() {
        let messages = vec![json!({"role": "assistant", "content": "x", "tool_calls": null})];
        let clean = sanitize_messages(&messages, true);
        assert!(clean[0].get("tool_calls").is_none());
    }

    #[test]
    fn test_multimodal_content_counts_as_content() {
        let messages = vec![json!({
            "role": "user",
            "content": [{"type": "text", "text": "see image"}]
        })];
        assert_eq!(sanitize_messages(&messages, true).len(), 1);
    }
}
