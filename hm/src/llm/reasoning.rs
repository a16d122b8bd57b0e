//! Reasoning-token configuration embedded in model strings
//!
//! Syntax: `provider/model[:variant][::reasoning_spec[::flags]]`
//!
//! The `::` delimiter keeps clear of provider single-colon suffixes like
//! `:free` or `:thinking`. The reasoning_spec is one of:
//!
//! - an effort level: `xhigh | high | medium | low | minimal | none`
//! - a bare token budget: `16000`
//! - effort with budget: `high(16000)`
//! - an enable keyword: `on | true | auto | enabled`
//!
//! Flags: `exclude` hides reasoning text from the response.
//!
//! Examples:
//!
//! ```text
//! xai/grok-4::high
//! xai/grok-4::16000
//! xai/grok-4:free::high(8000)::exclude
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

const EFFORT_LEVELS: &[&str] = &["xhigh", "high", "medium", "low", "minimal", "none"];
const ENABLE_KEYWORDS: &[&str] = &["on", "true", "auto", "enabled"];

/// Parsed reasoning configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub effort: Option<String>,
    pub max_tokens: Option<u32>,
    pub exclude: bool,
}

impl ReasoningConfig {
    /// Request payload for the provider's `reasoning` parameter.
    ///
    /// Providers accept only ONE of effort or max_tokens; when both were
    /// written (`high(6000)`), the explicit budget wins and the effort level
    /// is just a hint for choosing it.
    pub fn to_api_value(&self) -> Value {
        let mut result = serde_json::Map::new();

        if let Some(max_tokens) = self.max_tokens {
            result.insert("max_tokens".to_string(), json!(max_tokens));
        } else if let Some(effort) = &self.effort {
            result.insert("effort".to_string(), json!(effort));
        }

        if self.exclude {
            result.insert("exclude".to_string(), json!(true));
        }

        if result.is_empty() {
            // Enabled with provider defaults
            result.insert("enabled".to_string(), json!(true));
        }

        Value::Object(result)
    }
}

/// Split a model spec into the clean model name and its reasoning config.
///
/// Everything before the first `::` is the model (single-colon variants
/// preserved); the rest is parsed as spec + flags. Returns `None` config
/// when no `::` is present.
pub fn parse_model_spec(spec: &str) -> (String, Option<ReasoningConfig>) {
    if spec.is_empty() || !spec.contains("::") {
        return (spec.to_string(), None);
    }

    let mut parts = spec.split("::");
    let model = parts.next().unwrap_or_default().to_string();

    let mut config = ReasoningConfig::default();
    let mut spec_parsed = false;

    for part in parts {
        let part = part.trim().to_lowercase();
        if part.is_empty() {
            continue;
        }

        if part == "exclude" {
            config.exclude = true;
            continue;
        }

        if spec_parsed {
            warn!(%part, "parse_model_spec: extra reasoning spec ignored");
            continue;
        }
        spec_parsed = true;

        if let Some(parsed) = parse_spec_part(&part) {
            config.effort = parsed.0;
            config.max_tokens = parsed.1;
        }
    }

    (model, Some(config))
}

/// Parse one spec token: `word`, `word(budget)` or a bare budget.
/// Returns `(effort, max_tokens)`; enable keywords yield `(None, None)`.
fn parse_spec_part(part: &str) -> Option<(Option<String>, Option<u32>)> {
    if let Ok(budget) = part.parse::<u32>() {
        return Some((None, Some(budget)));
    }

    let (word, budget) = match part.find('(') {
        Some(open) if part.ends_with(')') => {
            let word = &part[..open];
            let inner = &part[open + 1..part.len() - 1];
            match inner.parse::<u32>() {
                Ok(n) => (word, Some(n)),
                Err(_) => {
                    warn!(%part, "parse_model_spec: unparsable token budget, ignoring");
                    (word, None)
                }
            }
        }
        _ => (part, None),
    };

    if EFFORT_LEVELS.contains(&word) {
        return Some((Some(word.to_string()), budget));
    }
    if ENABLE_KEYWORDS.contains(&word) {
        return Some((None, budget));
    }

    warn!(%word, "parse_model_spec: unknown reasoning effort level, ignoring");
    None
}

/// Reconstruct a model spec string. Inverse of [`parse_model_spec`]:
/// formatting then re-parsing yields the same `(model, config)` pair.
pub fn format_model_spec(model: &str, config: Option<&ReasoningConfig>) -> String {
    let config = match config {
        Some(c) => c,
        None => return model.to_string(),
    };

    let mut parts = vec![model.to_string()];

    match (&config.effort, config.max_tokens) {
        (Some(effort), Some(budget)) => parts.push(format!("{effort}({budget})")),
        (Some(effort), None) => parts.push(effort.clone()),
        (None, Some(budget)) => parts.push(budget.to_string()),
        (None, None) => parts.push("on".to_string()),
    }

    if config.exclude {
        parts.push("exclude".to_string());
    }

    parts.join("::")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_reasoning_suffix() {
        let (model, config) = parse_model_spec("xai/grok-4");
        assert_eq!(model, "xai/grok-4");
        assert!(config.is_none());
    }

    #[test]
    fn test_effort_only() {
        let (model, config) = parse_model_spec("xai/grok-4::high");
        assert_eq!(model, "xai/grok-4");
        let config = config.unwrap();
        assert_eq!(config.effort.as_deref(), Some("high"));
        assert_eq!(config.max_tokens, None);
        assert!(!config.exclude);
    }

    #[test]
    fn test_bare_budget() {
        let (_, config) = parse_model_spec("m::16000");
        let config = config.unwrap();
        assert_eq!(config.max_tokens, Some(16000));
        assert_eq!(config.effort, None);
    }

    #[test]
    fn test_effort_with_budget_and_variant_preserved() {
        let (model, config) = parse_model_spec("xai/grok-4:free::high(8000)");
        assert_eq!(model, "xai/grok-4:free");
        let config = config.unwrap();
        assert_eq!(config.effort.as_deref(), Some("high"));
        assert_eq!(config.max_tokens, Some(8000));
    }

    #[test]
    fn test_exclude_flag() {
        let (_, config) = parse_model_spec("m::16000::exclude");
        let config = config.unwrap();
        assert_eq!(config.max_tokens, Some(16000));
        assert!(config.exclude);
    }

    #[test]
    fn test_enable_keyword() {
        let (_, config) = parse_model_spec("m::on");
        let config = config.unwrap();
        assert_eq!(config.effort, None);
        assert_eq!(config.max_tokens, None);
    }

    #[test]
    fn test_unknown_effort_ignored() {
        let (_, config) = parse_model_spec("m::bogus");
        let config = config.unwrap();
        assert_eq!(config.effort, None);
        assert_eq!(config.max_tokens, None);
    }

    #[test]
    fn test_api_value_budget_wins_over_effort() {
        let config = ReasoningConfig {
            effort: Some("high".to_string()),
            max_tokens: Some(6000),
            exclude: true,
        };
        let api = config.to_api_value();
        assert_eq!(api["max_tokens"], 6000);
        assert!(api.get("effort").is_none());
        assert_eq!(api["exclude"], true);
    }

    #[test]
    fn test_api_value_effort_none_passes_through() {
        let config = ReasoningConfig {
            effort: Some("none".to_string()),
            max_tokens: None,
            exclude: false,
        };
        assert_eq!(config.to_api_value()["effort"], "none");
    }

    #[test]
    fn test_api_value_enabled_default() {
        let config = ReasoningConfig::default();
        assert_eq!(config.to_api_value()["enabled"], true);
    }

    #[test]
    fn test_format_parse_round_trip() {
        // Parsing then formatting then re-parsing is the identity on
        // (model, config) over the defined grammar
        for spec in [
            "vendor/m",
            "vendor/m::high",
            "vendor/m::high(8000)",
            "vendor/m::12000",
            "vendor/m::on",
            "vendor/m::high::exclude",
            "vendor/m:free::minimal(200)::exclude",
        ] {
            let (model, config) = parse_model_spec(spec);
            let formatted = format_model_spec(&model, config.as_ref());
            let (model2, config2) = parse_model_spec(&formatted);
            assert_eq!(model, model2, "model mismatch for {spec}");
            assert_eq!(config, config2, "config mismatch for {spec}");
        }
    }
}
