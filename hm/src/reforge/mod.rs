//! Reforge engine - sequential refinement over a soundings winner
//!
//! Round k runs an M-wide soundings whose mutations refine the winner of
//! round k-1 (round 0 being the initial soundings winner). The final
//! round's winner becomes the phase output.

use logstore::NodeType;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::cascade::{ReforgeConfig, SoundingsConfig};
use crate::echo::{Echo, HistoryOptions};
use crate::soundings::{AttemptBody, AttemptResult, SoundingsEngine, SoundingsRun};

/// Drive K refinement rounds from an initial winner. The body is the same
/// phase-body adapter the initial soundings used; each round's attempts see
/// their `reforge_step` and a refine mutation built on the prior winner.
pub async fn run_reforge(
    engine: &SoundingsEngine,
    config: &ReforgeConfig,
    phase_name: &str,
    echo: &Echo,
    parent_trace: Option<String>,
    initial_winner: AttemptResult,
    body: &dyn AttemptBody,
) -> eyre::Result<AttemptResult> {
    debug!(%phase_name, steps = config.steps, factor = config.factor_per_step, "run_reforge");
    let mut current = initial_winner;

    for step in 1..=config.steps {
        info!(%phase_name, step, "reforge round starting");

        let run = SoundingsRun {
            config: SoundingsConfig {
                factor: config.factor_per_step,
                evaluator: config.evaluator.clone(),
                mutate: None,
                max_parallel: None,
                reforge: None,
            },
            phase_name: phase_name.to_string(),
            echo: echo.clone(),
            parent_trace: parent_trace.clone(),
            reforge_step: Some(step),
            refine_base: Some(content_text(&current.output)),
        };

        let outcome = engine
            .run(&run, body)
            .await
            .map_err(|e| e.wrap_err(format!("reforge round {step} failed for phase {phase_name}")))?;

        log_round(echo, phase_name, step, &outcome.winner, parent_trace.as_deref());
        current = outcome.winner;
    }

    Ok(current)
}

fn log_round(echo: &Echo, phase_name: &str, step: u32, winner: &AttemptResult, parent_trace: Option<&str>) {
    let entry = json!({
        "role": "system",
        "content": winner.output,
    });
    let mut opts = HistoryOptions::node(NodeType::ReforgeStep)
        .with_meta("phase_name", json!(phase_name))
        .with_meta("reforge_step", json!(step))
        .with_meta("is_winner", json!(true));
    if let Some(parent) = parent_trace {
        opts = opts.with_parent(parent);
    }
    echo.add_history(&entry, opts);
}

fn content_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::EvaluatorSpec;
    use crate::llm::ModelTurn;
    use crate::llm::client::mock::MockModelClient;
    use crate::soundings::AttemptSpec;
    use futures::future::BoxFuture;
    use std::sync::Arc;

    /// Body whose output is `v{step+1}` for the attempt matching the step,
    /// `stale` otherwise - so each round has exactly one "better" candidate.
    struct RefiningBody;

    impl AttemptBody for RefiningBody {
        fn launch(&self, spec: AttemptSpec) -> BoxFuture<'static, eyre::Result<AttemptResult>> {
            Box::pin(async move {
                let step = spec.reforge_step.unwrap_or(0);
                let output = if spec.index == 0 {
                    format!("v{}", step + 1)
                } else {
                    "stale".to_string()
                };
                Ok(AttemptResult {
                    output: json!(output),
                    cost: 0.01,
                    tokens: 2,
                    duration_ms: 1,
                    trace_id: None,
                })
            })
        }
    }

    #[tokio::test]
    async fn test_two_rounds_refine_to_v3() {
        let echo = Echo::new("reforge-test-1", None);
        // Each round's evaluator picks candidate 0 (the refined one)
        let client = MockModelClient::new(vec![
            ModelTurn::text(r#"{"winner": 0, "reasoning": "sharper"}"#),
            ModelTurn::text(r#"{"winner": 0, "reasoning": "sharper again"}"#),
        ]);
        let engine = SoundingsEngine::new(Arc::new(client), "stub/eval", 4);

        let config = ReforgeConfig {
            steps: 2,
            factor_per_step: 2,
            evaluator: Some(EvaluatorSpec::default()),
        };
        let initial = AttemptResult {
            output: json!("v1"),
            cost: 0.0,
            tokens: 0,
            duration_ms: 0,
            trace_id: None,
        };

        let final_winner = run_reforge(&engine, &config, "polish", &echo, None, initial, &RefiningBody)
            .await
            .unwrap();
        assert_eq!(final_winner.output, json!("v3"));

        let history = echo.history();
        // Two rounds, two attempts each
        let attempts: Vec<_> = history
            .iter()
            .filter(|e| e["node_type"] == json!("sounding_attempt"))
            .collect();
        assert_eq!(attempts.len(), 4);
        let steps: std::collections::HashSet<i64> = attempts
            .iter()
            .filter_map(|e| e["metadata"]["reforge_step"].as_i64())
            .collect();
        assert_eq!(steps, [1, 2].into_iter().collect());
        // One reforge_step winner entry per round
        assert_eq!(
            history
                .iter()
                .filter(|e| e["node_type"] == json!("reforge_step"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_zero_steps_returns_initial() {
        let echo = Echo::new("reforge-test-2", None);
        let engine = SoundingsEngine::new(Arc::new(MockModelClient::new(vec![])), "stub/eval", 4);
        let config = ReforgeConfig {
            steps: 0,
            factor_per_step: 2,
            evaluator: None,
        };
        let initial = AttemptResult {
            output: json!("untouched"),
            cost: 0.0,
            tokens: 0,
            duration_ms: 0,
            trace_id: None,
        };

        let winner = run_reforge(&engine, &config, "polish", &echo, None, initial, &RefiningBody)
            .await
            .unwrap();
        assert_eq!(winner.output, json!("untouched"));
    }
}
