//! Instruction-template rendering
//!
//! Phase instructions are Handlebars templates rendered against
//! `{input, state, outputs, lineage, this}`. `outputs` aliases the state
//! entries written by completed phases; `this` describes the executing
//! phase (name, turn, attempt).

use handlebars::Handlebars;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::echo::LineageEntry;

/// Context available to instruction templates
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub input: Value,
    pub state: Map<String, Value>,
    pub lineage: Vec<LineageEntry>,
    pub phase_name: String,
    pub turn: u32,
    pub attempt: u32,
}

impl TemplateContext {
    fn to_value(&self) -> Value {
        json!({
            "input": self.input,
            "state": self.state,
            // Phase outputs land in state keyed by phase name; "outputs" is
            // the reader-friendly alias
            "outputs": self.state,
            "lineage": self.lineage,
            "this": {
                "name": self.phase_name,
                "turn": self.turn,
                "attempt": self.attempt,
            },
        })
    }
}

/// Render a phase's instruction template.
pub fn render_instructions(template: &str, ctx: &TemplateContext) -> eyre::Result<String> {
    debug!(phase = %ctx.phase_name, turn = ctx.turn, "render_instructions");
    let mut registry = Handlebars::new();
    // Missing keys render empty rather than failing the phase
    registry.set_strict_mode(false);
    registry
        .render_template(template, &ctx.to_value())
        .map_err(|e| eyre::eyre!("template render failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        let mut state = Map::new();
        state.insert("draft".to_string(), json!("the draft text"));
        TemplateContext {
            input: json!({"x": "hello", "count": 3}),
            state,
            lineage: vec![LineageEntry {
                phase: "draft".to_string(),
                output: json!("the draft text"),
                trace_id: None,
            }],
            phase_name: "review".to_string(),
            turn: 1,
            attempt: 1,
        }
    }

    #[test]
    fn test_input_interpolation() {
        let rendered = render_instructions("Echo: {{ input.x }}", &ctx()).unwrap();
        assert_eq!(rendered, "Echo: hello");
    }

    #[test]
    fn test_outputs_alias_and_this() {
        let rendered = render_instructions(
            "Review {{ outputs.draft }} in phase {{ this.name }}, turn {{ this.turn }}",
            &ctx(),
        )
        .unwrap();
        assert_eq!(rendered, "Review the draft text in phase review, turn 1");
    }

    #[test]
    fn test_missing_keys_render_empty() {
        let rendered = render_instructions("Value: [{{ input.absent }}]", &ctx()).unwrap();
        assert_eq!(rendered, "Value: []");
    }

    #[test]
    fn test_conditional_block() {
        let rendered = render_instructions("{{#if input.count}}has count{{/if}}", &ctx()).unwrap();
        assert_eq!(rendered, "has count");
    }
}
