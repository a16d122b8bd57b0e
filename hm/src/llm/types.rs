//! Request and response types for the model client

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A tool made available to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments
    pub parameters: Value,
}

impl ToolDefinition {
    /// OpenAI-style function wrapper
    pub fn to_openai_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A tool call as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

impl ToolCallPayload {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: &Value) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: args.to_string(),
            },
        }
    }

    /// Parsed arguments; malformed JSON degrades to an empty object
    pub fn args_value(&self) -> Value {
        serde_json::from_str(&self.function.arguments).unwrap_or_else(|_| json!({}))
    }
}

/// One chat-completion request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model spec, possibly carrying a `::reasoning` suffix
    pub model_spec: String,

    /// System prompt; empty means none is sent
    pub system: String,

    /// Prior conversation as raw message objects. Sanitised before sending.
    pub history: Vec<Value>,

    /// Optional trailing user message
    pub user: Option<String>,

    pub tools: Vec<ToolDefinition>,

    /// Native tool-call mode vs in-prompt emulation
    pub use_native_tools: bool,

    /// Output modalities for image-generation chat models
    pub modalities: Option<Vec<String>>,

    /// Session correlation for logging (not sent to the model)
    pub session_id: Option<String>,
    pub trace_id: Option<String>,
    pub caller_id: Option<String>,
}

impl ChatRequest {
    pub fn new(model_spec: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            model_spec: model_spec.into(),
            system: system.into(),
            history: Vec::new(),
            user: None,
            tools: Vec::new(),
            use_native_tools: true,
            modalities: None,
            session_id: None,
            trace_id: None,
            caller_id: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Value>) -> Self {
        self.history = history;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// The structured result of one model turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTurn {
    pub role: String,
    pub content: String,

    /// Provider request id
    pub id: Option<String>,

    #[serde(default)]
    pub tool_calls: Vec<ToolCallPayload>,

    /// Normalised, deduplicated image payloads
    #[serde(default)]
    pub images: Vec<Value>,

    #[serde(default)]
    pub videos: Vec<Value>,

    /// Outbound request as sent (for logging and error forensics)
    pub full_request: Value,

    /// Provider response, normalised
    pub full_response: Value,

    /// Model the provider says it served
    pub model: String,

    /// Original model string including any reasoning spec
    pub model_requested: String,

    /// 0.0 for local providers, None until the cost enricher fills it
    pub cost: Option<f64>,

    pub tokens_in: i64,
    pub tokens_out: i64,
    pub tokens_reasoning: Option<i64>,

    pub provider: String,
    pub duration_ms: i64,

    pub reasoning_enabled: bool,
    pub reasoning_effort: Option<String>,
    pub reasoning_max_tokens: Option<u32>,
}

impl ModelTurn {
    /// A minimal assistant turn; the mock client and tests build on this.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            id: None,
            tool_calls: Vec::new(),
            images: Vec::new(),
            videos: Vec::new(),
            full_request: Value::Null,
            full_response: Value::Null,
            model: "stub".to_string(),
            model_requested: "stub".to_string(),
            cost: Some(0.0),
            tokens_in: 0,
            tokens_out: 0,
            tokens_reasoning: None,
            provider: "stub".to_string(),
            duration_ms: 0,
            reasoning_enabled: false,
            reasoning_effort: None,
            reasoning_max_tokens: None,
        }
    }

    pub fn with_tool_call(mut self, id: &str, name: &str, args: Value) -> Self {
        self.tool_calls.push(ToolCallPayload::new(id, name, &args));
        self
    }

    /// History entry shape for appending this turn to a conversation
    pub fn to_history_entry(&self) -> Value {
        let mut entry = json!({
            "role": self.role,
            "content": self.content,
        });
        if !self.tool_calls.is_empty() {
            entry["tool_calls"] = serde_json::to_value(&self.tool_calls).unwrap_or(Value::Null);
        }
        entry
    }
}

/// Result of an embedding call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingBatch {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub dim: usize,
    pub request_id: Option<String>,
    pub tokens: i64,
    pub provider: String,
}

/// Speech-to-text request
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub audio_base64: String,
    /// Source container: webm, ogg, wav, mp3...
    pub format: String,
    pub language: Option<String>,
    /// Context hint for the transcriber
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub trace_id: Option<String>,
}

/// Speech-to-text result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub language: String,
    pub model: String,
    pub request_id: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub provider: String,
}

/// Image generation request
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub n: u32,
    /// Images land in a directory scoped by session and cell
    pub session_id: Option<String>,
    pub cell_name: Option<String>,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            width: 1024,
            height: 1024,
            n: 1,
            session_id: None,
            cell_name: None,
        }
    }
}

/// Image generation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImages {
    pub content: String,
    /// API-servable relative paths
    pub images: Vec<String>,
    pub model: String,
    pub request_id: Option<String>,
    pub provider: String,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_definition_openai_schema() {
        let def = ToolDefinition {
            name: "set_state".to_string(),
            description: "Persist a key".to_string(),
            parameters: json!({"type": "object", "properties": {"key": {"type": "string"}}}),
        };
        let schema = def.to_openai_schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "set_state");
        assert_eq!(schema["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_tool_call_args_parsing() {
        let call = ToolCallPayload::new("c1", "echo", &json!({"x": 1}));
        assert_eq!(call.args_value(), json!({"x": 1}));

        let broken = ToolCallPayload {
            id: "c2".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "echo".to_string(),
                arguments: "not json".to_string(),
            },
        };
        assert_eq!(broken.args_value(), json!({}));
    }

    #[test]
    fn test_turn_to_history_entry() {
        let turn = ModelTurn::text("hi").with_tool_call("c1", "say", json!({"text": "hi"}));
        let entry = turn.to_history_entry();
        assert_eq!(entry["role"], "assistant");
        assert_eq!(entry["content"], "hi");
        assert_eq!(entry["tool_calls"][0]["function"]["name"], "say");

        let plain = ModelTurn::text("just text").to_history_entry();
        assert!(plain.get("tool_calls").is_none());
    }
}
