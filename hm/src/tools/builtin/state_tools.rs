//! Session-state tools

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::echo::lookup_session;
use crate::tools::context::ToolContext;
use crate::tools::traits::{NativeTool, ToolError, ToolOutput};

/// Persist a key/value pair into the session state for later phases
pub struct SetStateTool;

#[async_trait]
impl NativeTool for SetStateTool {
    fn name(&self) -> &'static str {
        "set_state"
    }

    fn description(&self) -> &'static str {
        "Updates the session state with a key-value pair. Use this to persist information for future phases."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "State key to set"},
                "value": {"description": "Value to store (any JSON value)"}
            },
            "required": ["key", "value"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let key = args["key"].as_str().ok_or_else(|| ToolError::InvalidArgs {
            tool: "set_state".to_string(),
            reason: "missing 'key'".to_string(),
        })?;
        let value = args.get("value").cloned().unwrap_or(Value::Null);
        debug!(session_id = %ctx.session_id, %key, "SetStateTool::invoke");

        let echo = lookup_session(&ctx.session_id).ok_or_else(|| ToolError::Execution {
            tool: "set_state".to_string(),
            reason: "No active session context found".to_string(),
        })?;

        echo.update_state(key, value.clone());
        Ok(ToolOutput::text(format!("State updated: {key} = {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::get_echo;

    #[tokio::test]
    async fn test_set_state_writes_to_session() {
        let echo = get_echo("state-tool-test", None);
        let ctx = ToolContext::new("state-tool-test");

        let output = SetStateTool
            .invoke(json!({"key": "color", "value": "teal"}), &ctx)
            .await
            .unwrap();
        assert!(output.content_text().contains("State updated"));
        assert_eq!(echo.get_state("color"), Some(json!("teal")));
    }

    #[tokio::test]
    async fn test_set_state_without_session_fails() {
        let ctx = ToolContext::new("state-tool-missing-session");
        let err = SetStateTool
            .invoke(json!({"key": "k", "value": 1}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution { .. }));
    }

    #[tokio::test]
    async fn test_set_state_missing_key() {
        let ctx = ToolContext::new("s");
        let err = SetStateTool.invoke(json!({"value": 1}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs { .. }));
    }
}
