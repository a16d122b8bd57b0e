//! Soundings engine - parallel exploratory attempts with winner selection
//!
//! N attempts of the same phase body run concurrently under a bounded pool.
//! Attempt #0 is the unmutated baseline; the rest vary per the mutation
//! policy. Attempts fail independently (`sounding_error`); after all settle
//! an evaluator picks the winner. Only when every attempt errors does the
//! group fail.

mod evaluator;
mod mutation;

use std::sync::Arc;

use futures::future::BoxFuture;
use logstore::NodeType;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cascade::SoundingsConfig;
use crate::echo::{Echo, HistoryOptions};
use crate::llm::ModelClient;

pub use evaluator::{Candidate, Selection, select_winner};
pub use mutation::{Mutation, apply_mutation, mutation_for_attempt, refine_mutation};

/// What one attempt is asked to do
#[derive(Debug, Clone)]
pub struct AttemptSpec {
    pub index: u32,
    pub mutation: Option<Mutation>,
    /// Set during reforge rounds
    pub reforge_step: Option<u32>,
    pub parent_trace: Option<String>,
}

/// What one attempt produced
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub output: Value,
    pub cost: f64,
    pub tokens: i64,
    pub duration_ms: i64,
    pub trace_id: Option<String>,
}

/// One attempt's full story, as logged
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub index: u32,
    pub mutation: Option<Mutation>,
    pub result: Option<AttemptResult>,
    pub error: Option<String>,
    pub is_winner: bool,
}

/// The group's outcome
#[derive(Debug, Clone)]
pub struct SoundingsOutcome {
    pub winner_index: u32,
    pub winner: AttemptResult,
    pub attempts: Vec<AttemptRecord>,
    pub evaluator_reasoning: String,
}

/// Executes one attempt of the phase body. The phase runner implements
/// this by running its turn loop with the (possibly mutated) prompt.
pub trait AttemptBody: Send + Sync {
    fn launch(&self, spec: AttemptSpec) -> BoxFuture<'static, eyre::Result<AttemptResult>>;
}

/// Inputs for one soundings group
pub struct SoundingsRun {
    pub config: SoundingsConfig,
    pub phase_name: String,
    pub echo: Echo,
    pub parent_trace: Option<String>,
    /// Reforge round number, when refining
    pub reforge_step: Option<u32>,
    /// Previous winner's output; its presence switches mutations to
    /// refine-style
    pub refine_base: Option<String>,
}

pub struct SoundingsEngine {
    client: Arc<dyn ModelClient>,
    evaluator_model: String,
    max_parallel: usize,
}

impl SoundingsEngine {
    pub fn new(client: Arc<dyn ModelClient>, evaluator_model: impl Into<String>, max_parallel: usize) -> Self {
        Self {
            client,
            evaluator_model: evaluator_model.into(),
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run the group: launch attempts, wait for all to settle, select the
    /// winner, log everything.
    pub async fn run(&self, run: &SoundingsRun, body: &dyn AttemptBody) -> eyre::Result<SoundingsOutcome> {
        let factor = run.config.factor.max(1);
        let limit = run.config.max_parallel.unwrap_or(self.max_parallel).max(1);
        debug!(phase = %run.phase_name, factor, limit, reforge_step = ?run.reforge_step, "SoundingsEngine::run");

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks: JoinSet<(u32, eyre::Result<AttemptResult>)> = JoinSet::new();

        let mut mutations: Vec<Option<Mutation>> = Vec::with_capacity(factor as usize);
        for index in 0..factor {
            let mutation = match &run.refine_base {
                Some(base) => Some(refine_mutation(base, index)),
                None => mutation_for_attempt(run.config.mutate, index),
            };
            mutations.push(mutation.clone());

            let spec = AttemptSpec {
                index,
                mutation,
                reforge_step: run.reforge_step,
                parent_trace: run.parent_trace.clone(),
            };
            let semaphore = semaphore.clone();
            let future = body.launch(spec);
            tasks.spawn(async move {
                // Bounded concurrency; the permit lives for the attempt
                let _permit = semaphore.acquire_owned().await;
                (index, future.await)
            });
        }

        let mut settled: Vec<Option<(u32, eyre::Result<AttemptResult>)>> = (0..factor).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => settled[index as usize] = Some((index, result)),
                Err(e) => warn!(error = %e, "sounding attempt task panicked"),
            }
        }

        let mut records: Vec<AttemptRecord> = Vec::with_capacity(factor as usize);
        for (index, slot) in settled.into_iter().enumerate() {
            let index = index as u32;
            let mutation = mutations[index as usize].clone();
            match slot {
                Some((_, Ok(result))) => records.push(AttemptRecord {
                    index,
                    mutation,
                    result: Some(result),
                    error: None,
                    is_winner: false,
                }),
                Some((_, Err(e))) => records.push(AttemptRecord {
                    index,
                    mutation,
                    result: None,
                    error: Some(e.to_string()),
                    is_winner: false,
                }),
                None => records.push(AttemptRecord {
                    index,
                    mutation,
                    result: None,
                    error: Some("attempt task panicked".to_string()),
                    is_winner: false,
                }),
            }
        }

        let candidates: Vec<Candidate> = records
            .iter()
            .filter_map(|record| {
                record.result.as_ref().map(|result| Candidate {
                    index: record.index,
                    content: content_text(&result.output),
                    cost: result.cost,
                })
            })
            .collect();

        if candidates.is_empty() {
            self.log_attempts(run, &records);
            return Err(eyre::eyre!(
                "all {factor} sounding attempts failed for phase {}",
                run.phase_name
            ));
        }

        let selection = select_winner(
            &self.client,
            &self.evaluator_model,
            run.config.evaluator.as_ref(),
            &candidates,
        )
        .await;

        for record in &mut records {
            record.is_winner = record.index == selection.winner_index;
        }

        self.log_evaluator(run, &selection);
        self.log_attempts(run, &records);

        let winner = records
            .iter()
            .find(|r| r.is_winner)
            .and_then(|r| r.result.clone())
            .ok_or_else(|| eyre::eyre!("winner index {} has no result", selection.winner_index))?;

        Ok(SoundingsOutcome {
            winner_index: selection.winner_index,
            winner,
            attempts: records,
            evaluator_reasoning: selection.reasoning,
        })
    }

    fn log_evaluator(&self, run: &SoundingsRun, selection: &Selection) {
        let entry = json!({
            "role": "system",
            "content": selection.reasoning,
        });
        let mut opts = HistoryOptions::node(NodeType::Evaluator)
            .with_meta("phase_name", json!(run.phase_name))
            .with_meta("winner_index", json!(selection.winner_index))
            .with_meta("semantic_actor", json!("evaluator"));
        if let Some(model) = &selection.model {
            opts = opts.with_meta("model", json!(model));
        }
        if let Some(step) = run.reforge_step {
            opts = opts.with_meta("reforge_step", json!(step));
        }
        if let Some(parent) = &run.parent_trace {
            opts = opts.with_parent(parent.clone());
        }
        run.echo.add_history(&entry, opts);
    }

    fn log_attempts(&self, run: &SoundingsRun, records: &[AttemptRecord]) {
        for record in records {
            let content = match (&record.result, &record.error) {
                (Some(result), _) => result.output.clone(),
                (None, Some(error)) => json!(format!("Error: {error}")),
                (None, None) => Value::Null,
            };

            let mut opts = HistoryOptions::node(NodeType::SoundingAttempt)
                .with_meta("phase_name", json!(run.phase_name))
                .with_meta("sounding_index", json!(record.index))
                .with_meta("is_winner", json!(record.is_winner));
            if let Some(step) = run.reforge_step {
                opts = opts.with_meta("reforge_step", json!(step));
            }
            if let Some(mutation) = &record.mutation {
                opts = opts
                    .with_meta("mutation_applied", json!(mutation.instruction))
                    .with_meta("mutation_type", json!(mutation.mutation_type.as_str()));
                if let Some(template) = &mutation.template {
                    opts = opts.with_meta("mutation_template", json!(template));
                }
            }
            if let Some(result) = &record.result {
                opts = opts
                    .with_meta("cost", json!(result.cost))
                    .with_meta("tokens_out", json!(result.tokens))
                    .with_meta("duration_ms", json!(result.duration_ms));
            }
            if let Some(parent) = &run.parent_trace {
                opts = opts.with_parent(parent.clone());
            }

            let entry = json!({"role": "assistant", "content": content});
            run.echo.add_history(&entry, opts);

            if let Some(error) = &record.error {
                let mut error_opts = HistoryOptions::node(NodeType::SoundingError)
                    .with_meta("phase_name", json!(run.phase_name))
                    .with_meta("sounding_index", json!(record.index));
                if let Some(parent) = &run.parent_trace {
                    error_opts = error_opts.with_parent(parent.clone());
                }
                run.echo
                    .add_history(&json!({"role": "system", "content": error}), error_opts);
            }
        }
    }
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
    use crate::cascade::{EvaluatorSpec, MutationMode};
    use crate::llm::ModelTurn;
    use crate::llm::client::mock::MockModelClient;

    /// Body returning a fixed list of outputs by attempt index
    struct ScriptedBody {
        outputs: Vec<Result<&'static str, &'static str>>,
    }

    impl AttemptBody for ScriptedBody {
        fn launch(&self, spec: AttemptSpec) -> BoxFuture<'static, eyre::Result<AttemptResult>> {
            let outcome = self.outputs[spec.index as usize];
            Box::pin(async move {
                match outcome {
                    Ok(output) => Ok(AttemptResult {
                        output: json!(output),
                        cost: 0.01 * (spec.index + 1) as f64,
                        tokens: 5,
                        duration_ms: 3,
                        trace_id: None,
                    }),
                    Err(error) => Err(eyre::eyre!(error)),
                }
            })
        }
    }

    fn engine(turns: Vec<ModelTurn>) -> SoundingsEngine {
        SoundingsEngine::new(Arc::new(MockModelClient::new(turns)), "stub/eval", 8)
    }

    fn run_for(echo: &Echo, factor: u32, evaluator: Option<EvaluatorSpec>) -> SoundingsRun {
        SoundingsRun {
            config: SoundingsConfig {
                factor,
                evaluator,
                mutate: Some(MutationMode::Augment),
                max_parallel: None,
                reforge: None,
            },
            phase_name: "probe".to_string(),
            echo: echo.clone(),
            parent_trace: None,
            reforge_step: None,
            refine_base: None,
        }
    }

    #[tokio::test]
    async fn test_three_attempts_one_winner() {
        let echo = Echo::new("soundings-test-1", None);
        let engine = engine(vec![ModelTurn::text(r#"{"winner": 1, "reasoning": "banana"}"#)]);
        let body = ScriptedBody {
            outputs: vec![Ok("apple"), Ok("banana"), Ok("cherry")],
        };

        let outcome = engine
            .run(&run_for(&echo, 3, Some(EvaluatorSpec::default())), &body)
            .await
            .unwrap();

        assert_eq!(outcome.winner_index, 1);
        assert_eq!(outcome.winner.output, json!("banana"));
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.attempts.iter().filter(|a| a.is_winner).count(), 1);
        assert!(outcome.attempts[1].is_winner);

        // History: one evaluator entry, exactly factor sounding_attempt entries
        let history = echo.history();
        let attempts: Vec<_> = history
            .iter()
            .filter(|e| e["node_type"] == json!("sounding_attempt"))
            .collect();
        assert_eq!(attempts.len(), 3);
        let winners: Vec<_> = attempts
            .iter()
            .filter(|e| e["metadata"]["is_winner"] == json!(true))
            .collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0]["metadata"]["sounding_index"], json!(1));
        assert_eq!(
            history
                .iter()
                .filter(|e| e["node_type"] == json!("evaluator"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_partial_failures_recoverable() {
        let echo = Echo::new("soundings-test-2", None);
        let engine = engine(vec![]);
        let body = ScriptedBody {
            outputs: vec![Ok("good"), Err("boom")],
        };

        let outcome = engine.run(&run_for(&echo, 2, None), &body).await.unwrap();
        assert_eq!(outcome.winner_index, 0);
        assert_eq!(outcome.attempts[1].error.as_deref(), Some("boom"));

        let history = echo.history();
        // Errored attempt still gets its sounding_attempt entry plus an error entry
        assert_eq!(
            history
                .iter()
                .filter(|e| e["node_type"] == json!("sounding_attempt"))
                .count(),
            2
        );
        assert_eq!(
            history
                .iter()
                .filter(|e| e["node_type"] == json!("sounding_error"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_all_failed_group_fails() {
        let echo = Echo::new("soundings-test-3", None);
        let engine = engine(vec![]);
        let body = ScriptedBody {
            outputs: vec![Err("a"), Err("b")],
        };

        let err = engine.run(&run_for(&echo, 2, None), &body).await.unwrap_err();
        assert!(err.to_string().contains("all 2 sounding attempts failed"));
    }

    #[tokio::test]
    async fn test_baseline_attempt_has_no_mutation() {
        let echo = Echo::new("soundings-test-4", None);
        let engine = engine(vec![ModelTurn::text(r#"{"winner": 0}"#)]);
        let body = ScriptedBody {
            outputs: vec![Ok("a"), Ok("b"), Ok("c")],
        };

        let outcome = engine
            .run(&run_for(&echo, 3, Some(EvaluatorSpec::default())), &body)
            .await
            .unwrap();
        assert!(outcome.attempts[0].mutation.is_none());
        assert!(outcome.attempts[1].mutation.is_some());
        assert_eq!(
            outcome.attempts[1].mutation.as_ref().unwrap().mutation_type,
            MutationMode::Augment
        );
    }
}
