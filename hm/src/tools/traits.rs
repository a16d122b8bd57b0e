//! Tool trait and canonical result shape

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use super::context::ToolContext;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    Unknown(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: String, reason: String },

    #[error("Tool {tool} failed: {reason}")]
    Execution { tool: String, reason: String },

    #[error("Critical tool {tool} failed: {reason}")]
    Critical { tool: String, reason: String },
}

/// A natively-implemented tool callable by the model
#[async_trait]
pub trait NativeTool: Send + Sync {
    /// Tool name as exposed to the model
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// JSON Schema for the argument object
    fn parameters(&self) -> Value;

    /// Critical tools propagate failures instead of folding them into an
    /// error result
    fn critical(&self) -> bool {
        false
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Canonical tool result: `{content, images?, audio?, _route?}`
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: Value,
    pub images: Vec<String>,
    pub audio: Vec<String>,
    /// Output discriminator consumed by routing
    pub route: Option<String>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: json!(content.into()),
            images: Vec::new(),
            audio: Vec::new(),
            route: None,
            is_error: false,
        }
    }

    pub fn json(content: Value) -> Self {
        Self {
            content,
            images: Vec::new(),
            audio: Vec::new(),
            route: None,
            is_error: false,
        }
    }

    /// Captured failure: `{content: "Error: ..."}`
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            content: json!(format!("Error: {message}")),
            images: Vec::new(),
            audio: Vec::new(),
            route: None,
            is_error: true,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_audio(mut self, audio: Vec<String>) -> Self {
        self.audio = audio;
        self
    }

    /// Wire shape per the tool invocation contract
    pub fn to_value(&self) -> Value {
        let mut out = json!({"content": self.content});
        if !self.images.is_empty() {
            out["images"] = json!(self.images);
        }
        if !self.audio.is_empty() {
            out["audio"] = json!(self.audio);
        }
        if let Some(route) = &self.route {
            out["_route"] = json!(route);
        }
        out
    }

    /// Content rendered as a plain string for history entries
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_output_shape() {
        let out = ToolOutput::error("boom");
        assert!(out.is_error);
        assert_eq!(out.content, json!("Error: boom"));
    }

    #[test]
    fn test_to_value_includes_optional_fields() {
        let out = ToolOutput::text("done")
            .with_route("fired")
            .with_images(vec!["/api/images/a.png".to_string()]);
        let value = out.to_value();
        assert_eq!(value["content"], "done");
        assert_eq!(value["_route"], "fired");
        assert_eq!(value["images"][0], "/api/images/a.png");
        assert!(value.get("audio").is_none());
    }

    #[test]
    fn test_plain_output_omits_extras() {
        let value = ToolOutput::text("x").to_value();
        assert_eq!(value, json!({"content": "x"}));
    }
}
