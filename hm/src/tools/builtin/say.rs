//! Speech tool - the narrator's voice
//!
//! Text-to-speech itself is an external collaborator; the tool funnels
//! utterances through the [`Speaker`] trait. The default speaker records the
//! utterance so runs without an audio backend still capture what would have
//! been said.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::tools::context::ToolContext;
use crate::tools::traits::{NativeTool, ToolError, ToolOutput};

/// Sink for spoken text. Implementations may synthesise audio and return an
/// API-servable path to the rendered file.
pub trait Speaker: Send + Sync {
    fn say(&self, text: &str, session_id: &str) -> Option<String>;
}

/// Default speaker: logs the utterance, produces no audio file
pub struct LogSpeaker;

impl Speaker for LogSpeaker {
    fn say(&self, text: &str, session_id: &str) -> Option<String> {
        info!(%session_id, "narration: {text}");
        None
    }
}

/// Capturing speaker for tests
#[derive(Default)]
pub struct RecordingSpeaker {
    pub utterances: Mutex<Vec<String>>,
}

impl Speaker for RecordingSpeaker {
    fn say(&self, text: &str, _session_id: &str) -> Option<String> {
        self.utterances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
        None
    }
}

/// Speak a short text aloud
pub struct SayTool {
    speaker: Arc<dyn Speaker>,
}

impl SayTool {
    pub fn new(speaker: Arc<dyn Speaker>) -> Self {
        Self { speaker }
    }
}

impl Default for SayTool {
    fn default() -> Self {
        Self::new(Arc::new(LogSpeaker))
    }
}

#[async_trait]
impl NativeTool for SayTool {
    fn name(&self) -> &'static str {
        "say"
    }

    fn description(&self) -> &'static str {
        "Speak a short text aloud. Use expressive tags sparingly: [excited], [curious], [thoughtful]."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to speak"}
            },
            "required": ["text"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let text = args["text"].as_str().ok_or_else(|| ToolError::InvalidArgs {
            tool: "say".to_string(),
            reason: "missing 'text'".to_string(),
        })?;
        debug!(session_id = %ctx.session_id, chars = text.len(), "SayTool::invoke");

        let audio_path = self.speaker.say(text, &ctx.session_id);
        let output = ToolOutput::json(json!({"spoken": text}));
        Ok(match audio_path {
            Some(path) => output.with_audio(vec![path]),
            None => output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_say_routes_through_speaker() {
        let speaker = Arc::new(RecordingSpeaker::default());
        let tool = SayTool::new(speaker.clone());

        let output = tool
            .invoke(json!({"text": "[excited] phase one complete!"}), &ToolContext::new("s"))
            .await
            .unwrap();
        assert_eq!(output.content["spoken"], "[excited] phase one complete!");
        assert_eq!(
            speaker.utterances.lock().unwrap().as_slice(),
            ["[excited] phase one complete!"]
        );
    }

    #[tokio::test]
    async fn test_say_requires_text() {
        let err = SayTool::default()
            .invoke(json!({}), &ToolContext::new("s"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs { .. }));
    }
}
