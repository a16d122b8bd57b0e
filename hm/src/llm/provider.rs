//! Provider identification from model strings

/// The provider segment of a `provider/model` string
pub fn extract_provider(model: &str) -> &str {
    match model.split_once('/') {
        Some((provider, _)) => provider,
        None => "unknown",
    }
}

/// Local / zero-cost providers get `cost = 0.0` immediately; everything
/// else starts at `None` and waits for the cost enricher.
pub fn is_free_provider(provider: &str) -> bool {
    matches!(provider, "ollama" | "local" | "deterministic" | "stub")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_provider() {
        assert_eq!(extract_provider("xai/grok-4"), "xai");
        assert_eq!(extract_provider("ollama/llama3:8b"), "ollama");
        assert_eq!(extract_provider("bare-model"), "unknown");
    }

    #[test]
    fn test_free_providers() {
        assert!(is_free_provider("ollama"));
        assert!(is_free_provider("stub"));
        assert!(!is_free_provider("openai"));
        assert!(!is_free_provider("unknown"));
    }
}
