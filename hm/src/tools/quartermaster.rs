//! Quartermaster - automatic tackle selection
//!
//! When a phase declares `tackle: manifest` instead of naming tools, a
//! lightweight model call reads the phase instructions against the tool
//! catalog and picks an appropriate subset. The selection is logged as a
//! `quartermaster_result`; subsequent turns use only the selected tools.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::{ChatRequest, ModelClient, ModelError};

use super::registry::ToolRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuartermasterResult {
    pub selected_tackle: Vec<String>,
    pub reasoning: String,
}

const SELECTION_PROMPT: &str = "You are a quartermaster choosing tools for a task. \
Given the task instructions and the available tool catalog, select ONLY the tools \
the task actually needs. Respond with a JSON object: \
{\"selected_tackle\": [\"tool_name\", ...], \"reasoning\": \"one sentence\"}. \
Select nothing rather than something irrelevant.";

/// Ask the selection model for an appropriate tool subset.
///
/// Unknown names in the model's answer are dropped; an unparseable answer
/// degrades to an empty selection rather than failing the phase.
pub async fn select_tackle(
    client: &dyn ModelClient,
    model: &str,
    instructions: &str,
    registry: &ToolRegistry,
) -> Result<QuartermasterResult, ModelError> {
    let catalog = registry.catalog();
    debug!(catalog_size = catalog.len(), "select_tackle");
    if catalog.is_empty() {
        return Ok(QuartermasterResult {
            selected_tackle: Vec::new(),
            reasoning: "no tools registered".to_string(),
        });
    }

    let catalog_text: String = catalog
        .iter()
        .map(|(name, description)| format!("- {name}: {description}"))
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!("## Task instructions\n{instructions}\n\n## Tool catalog\n{catalog_text}");

    let request = ChatRequest::new(model, SELECTION_PROMPT).with_user(user);
    let turn = client.run(request).await?;

    let mut result = parse_selection(&turn.content);
    result.selected_tackle.retain(|name| {
        let known = registry.has_tool(name);
        if !known {
            warn!(%name, "select_tackle: model selected unregistered tool, dropping");
        }
        known
    });
    Ok(result)
}

fn parse_selection(content: &str) -> QuartermasterResult {
    // The answer may wrap the JSON in prose or a code fence
    if let Some(json_str) = extract_json_object(content) {
        if let Ok(value) = serde_json::from_str::<Value>(&json_str) {
            let selected = value["selected_tackle"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            return QuartermasterResult {
                selected_tackle: selected,
                reasoning: value["reasoning"].as_str().unwrap_or_default().to_string(),
            };
        }
    }
    warn!("parse_selection: unparseable quartermaster answer, selecting nothing");
    let preview: String = content.chars().take(100).collect();
    QuartermasterResult {
        selected_tackle: Vec::new(),
        reasoning: format!("unparseable selection: {preview}"),
    }
}

/// First balanced `{...}` block in the text
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelTurn;
    use crate::llm::client::mock::MockModelClient;
    use crate::tools::builtin::register_builtins;
    use std::sync::Arc;

    fn registry_with_builtins() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        register_builtins(&registry);
        registry
    }

    #[tokio::test]
    async fn test_selection_filters_to_known_tools() {
        let registry = registry_with_builtins();
        let client = MockModelClient::new(vec![ModelTurn::text(
            r#"{"selected_tackle": ["set_state", "imaginary_tool"], "reasoning": "state is needed"}"#,
        )]);

        let result = select_tackle(&client, "stub/selector", "persist results", &registry)
            .await
            .unwrap();
        assert_eq!(result.selected_tackle, vec!["set_state"]);
        assert_eq!(result.reasoning, "state is needed");
    }

    #[tokio::test]
    async fn test_selection_handles_fenced_answer() {
        let registry = registry_with_builtins();
        let client = MockModelClient::new(vec![ModelTurn::text(
            "Here you go:\n```json\n{\"selected_tackle\": [\"say\"], \"reasoning\": \"speech\"}\n```",
        )]);

        let result = select_tackle(&client, "stub/selector", "speak updates", &registry)
            .await
            .unwrap();
        assert_eq!(result.selected_tackle, vec!["say"]);
    }

    #[tokio::test]
    async fn test_garbage_answer_selects_nothing() {
        let registry = registry_with_builtins();
        let client = MockModelClient::new(vec![ModelTurn::text("I cannot decide")]);

        let result = select_tackle(&client, "stub/selector", "anything", &registry)
            .await
            .unwrap();
        assert!(result.selected_tackle.is_empty());
    }

    #[test]
    fn test_extract_json_object_balanced() {
        assert_eq!(
            extract_json_object("prefix {\"a\": {\"b\": 1}} suffix").unwrap(),
            "{\"a\": {\"b\": 1}}"
        );
        assert!(extract_json_object("no braces").is_none());
        // Braces inside strings don't confuse the scanner
        assert_eq!(
            extract_json_object(r#"{"text": "brace } inside"}"#).unwrap(),
            r#"{"text": "brace } inside"}"#
        );
    }
}
