//! The unified log record schema
//!
//! One struct carries every field any producer may stamp. Most fields are
//! optional; producers fill what they know and the store persists the rest
//! as NULL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of a log record within the trace tree.
///
/// The set is open: new producers may introduce node types the store has
/// never seen, so unknown strings round-trip through [`NodeType::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeType {
    Cascade,
    Phase,
    Turn,
    TurnInput,
    ToolCall,
    ToolResult,
    Agent,
    User,
    Message,
    SoundingAttempt,
    SoundingError,
    ReforgeStep,
    Evaluator,
    PreWard,
    PostWard,
    Validation,
    ValidationStart,
    ValidationError,
    SchemaValidation,
    ValidationRetry,
    QuartermasterResult,
    ContextInjection,
    ContextSelection,
    Lifecycle,
    Structure,
    Embedding,
    Transcription,
    ImageGeneration,
    Narrator,
    Routing,
    Error,
    Other(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cascade => "cascade",
            Self::Phase => "phase",
            Self::Turn => "turn",
            Self::TurnInput => "turn_input",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Agent => "agent",
            Self::User => "user",
            Self::Message => "message",
            Self::SoundingAttempt => "sounding_attempt",
            Self::SoundingError => "sounding_error",
            Self::ReforgeStep => "reforge_step",
            Self::Evaluator => "evaluator",
            Self::PreWard => "pre_ward",
            Self::PostWard => "post_ward",
            Self::Validation => "validation",
            Self::ValidationStart => "validation_start",
            Self::ValidationError => "validation_error",
            Self::SchemaValidation => "schema_validation",
            Self::ValidationRetry => "validation_retry",
            Self::QuartermasterResult => "quartermaster_result",
            Self::ContextInjection => "context_injection",
            Self::ContextSelection => "context_selection",
            Self::Lifecycle => "lifecycle",
            Self::Structure => "structure",
            Self::Embedding => "embedding",
            Self::Transcription => "transcription",
            Self::ImageGeneration => "image_generation",
            Self::Narrator => "narrator",
            Self::Routing => "routing",
            Self::Error => "error",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "cascade" => Self::Cascade,
            "phase" => Self::Phase,
            "turn" => Self::Turn,
            "turn_input" => Self::TurnInput,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "agent" => Self::Agent,
            "user" => Self::User,
            "message" => Self::Message,
            "sounding_attempt" => Self::SoundingAttempt,
            "sounding_error" => Self::SoundingError,
            "reforge_step" => Self::ReforgeStep,
            "evaluator" => Self::Evaluator,
            "pre_ward" => Self::PreWard,
            "post_ward" => Self::PostWard,
            "validation" => Self::Validation,
            "validation_start" => Self::ValidationStart,
            "validation_error" => Self::ValidationError,
            "schema_validation" => Self::SchemaValidation,
            "validation_retry" => Self::ValidationRetry,
            "quartermaster_result" => Self::QuartermasterResult,
            "context_injection" => Self::ContextInjection,
            "context_selection" => Self::ContextSelection,
            "lifecycle" => Self::Lifecycle,
            "structure" => Self::Structure,
            "embedding" => Self::Embedding,
            "transcription" => Self::Transcription,
            "image_generation" => Self::ImageGeneration,
            "narrator" => Self::Narrator,
            "routing" => Self::Routing,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        })
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for NodeType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or(NodeType::Other(s)))
    }
}

/// A single unified log record.
///
/// Producers construct via [`LogRecord::new`] plus struct-update syntax:
///
/// ```ignore
/// let rec = LogRecord {
///     role: Some("assistant".into()),
///     content: Some(serde_json::json!("hello")),
///     ..LogRecord::new("sess-1", NodeType::Agent)
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    // Identity
    pub session_id: String,
    pub parent_session_id: Option<String>,
    pub caller_id: Option<String>,
    pub invocation_metadata: Option<Value>,
    pub trace_id: String,
    pub parent_id: Option<String>,

    // Classification
    pub node_type: NodeType,
    pub role: Option<String>,
    pub semantic_actor: Option<String>,
    pub semantic_purpose: Option<String>,
    pub depth: i64,

    // Structure
    pub cascade_id: Option<String>,
    pub cascade_file: Option<String>,
    pub cell_name: Option<String>,
    pub phase_name: Option<String>,
    pub turn_number: Option<i64>,
    pub attempt_number: Option<i64>,
    pub sounding_index: Option<i64>,
    pub is_winner: Option<bool>,
    pub reforge_step: Option<i64>,

    // Evolution
    pub species_hash: Option<String>,
    pub mutation_applied: Option<String>,
    pub mutation_type: Option<String>,
    pub mutation_template: Option<String>,
    pub is_callout: Option<bool>,
    pub callout_name: Option<String>,

    // Payload
    pub content: Option<Value>,
    pub tool_calls: Option<Value>,
    pub images: Option<Vec<String>>,
    pub audio: Option<Vec<String>>,
    pub has_base64: Option<bool>,

    // Model
    pub model: Option<String>,
    pub provider: Option<String>,
    pub request_id: Option<String>,
    pub duration_ms: Option<i64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub tokens_reasoning: Option<i64>,
    pub cost: Option<f64>,

    // Visualisation
    pub mermaid_content: Option<String>,

    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Create a record with a fresh trace id and everything else unset.
    pub fn new(session_id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            session_id: session_id.into(),
            parent_session_id: None,
            caller_id: None,
            invocation_metadata: None,
            trace_id: uuid::Uuid::now_v7().to_string(),
            parent_id: None,
            node_type,
            role: None,
            semantic_actor: None,
            semantic_purpose: None,
            depth: 0,
            cascade_id: None,
            cascade_file: None,
            cell_name: None,
            phase_name: None,
            turn_number: None,
            attempt_number: None,
            sounding_index: None,
            is_winner: None,
            reforge_step: None,
            species_hash: None,
            mutation_applied: None,
            mutation_type: None,
            mutation_template: None,
            is_callout: None,
            callout_name: None,
            content: None,
            tool_calls: None,
            images: None,
            audio: None,
            has_base64: None,
            model: None,
            provider: None,
            request_id: None,
            duration_ms: None,
            tokens_in: None,
            tokens_out: None,
            tokens_reasoning: None,
            cost: None,
            mermaid_content: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Content rendered as a plain string (for summaries and CLI display).
    pub fn content_text(&self) -> String {
        match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }
}

/// Usage data reconciled into a previously-appended record by `request_id`.
///
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostUpdate {
    pub cost: Option<f64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub tokens_reasoning: Option<i64>,
    pub duration_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_round_trip() {
        for nt in [
            NodeType::Cascade,
            NodeType::SoundingAttempt,
            NodeType::QuartermasterResult,
            NodeType::PreWard,
        ] {
            let parsed: NodeType = nt.as_str().parse().unwrap();
            assert_eq!(parsed, nt);
        }
    }

    #[test]
    fn test_node_type_unknown_preserved() {
        let parsed: NodeType = "sub_echo".parse().unwrap();
        assert_eq!(parsed, NodeType::Other("sub_echo".to_string()));
        assert_eq!(parsed.as_str(), "sub_echo");
    }

    #[test]
    fn test_node_type_serde_as_string() {
        let json = serde_json::to_string(&NodeType::ToolResult).unwrap();
        assert_eq!(json, "\"tool_result\"");
        let back: NodeType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeType::ToolResult);
    }

    #[test]
    fn test_record_new_has_trace_id() {
        let rec = LogRecord::new("sess-1", NodeType::Turn);
        assert!(!rec.trace_id.is_empty());
        assert_eq!(rec.session_id, "sess-1");
        assert_eq!(rec.depth, 0);
        assert!(rec.cost.is_none());
    }

    #[test]
    fn test_content_text_variants() {
        let mut rec = LogRecord::new("s", NodeType::Message);
        assert_eq!(rec.content_text(), "");
        rec.content = Some(serde_json::json!("plain"));
        assert_eq!(rec.content_text(), "plain");
        rec.content = Some(serde_json::json!({"k": 1}));
        assert_eq!(rec.content_text(), "{\"k\":1}");
    }
}
