//! Card request and card row types, plus the eligibility rule

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node types that never get a card: structural and lifecycle entries that
/// carry no substantive content worth recalling later.
const STRUCTURAL_NODE_TYPES: &[&str] = &[
    "context_injection",
    "context_selection",
    "lifecycle",
    "cascade",
    "phase",
    "turn",
    "structure",
    "validation_start",
    "validation_error",
];

/// Node types that do get a card
const SUBSTANTIVE_NODE_TYPES: &[&str] = &[
    "agent",
    "tool",
    "tool_result",
    "tool_call",
    "user",
    "message",
    "turn_input",
    "evaluator",
    "sounding_attempt",
];

/// Decide whether a message should get a context card.
///
/// System messages and structural entries are skipped; only substantive
/// content useful for later context selection qualifies.
pub fn card_eligible(node_type: &str, role: Option<&str>) -> bool {
    if role == Some("system") {
        return false;
    }
    if STRUCTURAL_NODE_TYPES.contains(&node_type) {
        return false;
    }
    SUBSTANTIVE_NODE_TYPES.contains(&node_type)
}

/// A request to generate a context card for one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardRequest {
    pub session_id: String,
    pub content_hash: String,
    pub role: String,
    pub content: Value,
    pub phase_name: Option<String>,
    pub cascade_id: Option<String>,
    pub turn_number: Option<i64>,
    pub is_callout: bool,
    pub callout_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CardRequest {
    pub fn new(
        session_id: impl Into<String>,
        content_hash: impl Into<String>,
        role: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            content_hash: content_hash.into(),
            role: role.into(),
            content,
            phase_name: None,
            cascade_id: None,
            turn_number: None,
            is_callout: false,
            callout_name: None,
            timestamp: Utc::now(),
        }
    }
}

/// A generated context card, joinable with the unified log via
/// `(session_id, content_hash)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCard {
    pub session_id: String,
    pub content_hash: String,
    pub role: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub estimated_tokens: usize,
    pub phase_name: Option<String>,
    pub cascade_id: Option<String>,
    pub turn_number: Option<i64>,
    pub is_callout: bool,
    pub callout_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_role_never_eligible() {
        assert!(!card_eligible("agent", Some("system")));
        assert!(!card_eligible("message", Some("system")));
    }

    #[test]
    fn test_structural_nodes_not_eligible() {
        for nt in ["cascade", "phase", "turn", "lifecycle", "validation_start"] {
            assert!(!card_eligible(nt, Some("assistant")), "{nt} should be skipped");
        }
    }

    #[test]
    fn test_substantive_nodes_eligible() {
        for nt in ["agent", "tool_result", "user", "evaluator", "sounding_attempt"] {
            assert!(card_eligible(nt, Some("assistant")), "{nt} should qualify");
        }
    }

    #[test]
    fn test_unknown_node_type_not_eligible() {
        assert!(!card_eligible("mystery", None));
    }
}
