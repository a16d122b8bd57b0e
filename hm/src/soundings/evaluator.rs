//! Winner selection over sounding attempts

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::cascade::{EvaluatorSpec, TieBreak};
use crate::llm::{ChatRequest, ModelClient};

/// One successful attempt as presented to the evaluator
#[derive(Debug, Clone)]
pub struct Candidate {
    pub index: u32,
    pub content: String,
    pub cost: f64,
}

/// The evaluator's decision
#[derive(Debug, Clone)]
pub struct Selection {
    pub winner_index: u32,
    pub reasoning: String,
    /// Model used, when a model actually judged
    pub model: Option<String>,
}

/// Pick a winner among the candidates.
///
/// With an evaluator configured, a model judges the outputs; a tie or an
/// unparseable verdict falls back to the configured tie-break rule. With no
/// evaluator, the tie-break rule decides directly.
pub async fn select_winner(
    client: &Arc<dyn ModelClient>,
    default_model: &str,
    spec: Option<&EvaluatorSpec>,
    candidates: &[Candidate],
) -> Selection {
    debug!(count = candidates.len(), "select_winner");
    assert!(!candidates.is_empty(), "select_winner requires at least one candidate");

    let tie_break = spec.map(|s| s.tie_break).unwrap_or_default();

    if candidates.len() == 1 {
        return Selection {
            winner_index: candidates[0].index,
            reasoning: "single surviving attempt".to_string(),
            model: None,
        };
    }

    let Some(spec) = spec else {
        return break_tie(tie_break, candidates, "no evaluator configured");
    };

    let model = spec.model.clone().unwrap_or_else(|| default_model.to_string());
    let instructions = spec
        .instructions
        .clone()
        .unwrap_or_else(|| "Pick the strongest, most correct and most useful output.".to_string());

    let mut listing = String::new();
    for candidate in candidates {
        listing.push_str(&format!(
            "### Candidate {} (cost ${:.4})\n{}\n\n",
            candidate.index, candidate.cost, candidate.content
        ));
    }

    let system = "You are an evaluator choosing among candidate outputs for the same task. \
                  Respond with a JSON object: {\"winner\": <candidate number>, \"reasoning\": \"...\"}. \
                  If candidates are indistinguishable, respond {\"winner\": \"tie\", \"reasoning\": \"...\"}.";
    let user = format!("## Selection criteria\n{instructions}\n\n## Candidates\n{listing}");

    let request = ChatRequest::new(model.as_str(), system).with_user(user);
    match client.run(request).await {
        Ok(turn) => match parse_winner(&turn.content, candidates) {
            Some(winner_index) => Selection {
                winner_index,
                reasoning: turn.content.clone(),
                model: Some(model),
            },
            None => {
                warn!("select_winner: tie or unparseable verdict, applying tie-break");
                break_tie(tie_break, candidates, &format!("tie-break after: {}", turn.content))
            }
        },
        Err(e) => {
            warn!(error = %e, "select_winner: evaluator call failed, applying tie-break");
            break_tie(tie_break, candidates, &format!("evaluator failed: {e}"))
        }
    }
}

fn break_tie(rule: TieBreak, candidates: &[Candidate], reasoning: &str) -> Selection {
    let winner = match rule {
        TieBreak::FirstInOrder => candidates[0].index,
        TieBreak::LowestCost => {
            candidates
                .iter()
                .min_by(|a, b| a.cost.partial_cmp(&b.cost).unwrap_or(std::cmp::Ordering::Equal))
                .map(|c| c.index)
                .unwrap_or(candidates[0].index)
        }
    };
    Selection {
        winner_index: winner,
        reasoning: reasoning.to_string(),
        model: None,
    }
}

/// Read the winner index out of an evaluator answer. Accepts a JSON
/// `{"winner": N}` verdict or the first standalone integer in the text;
/// returns `None` on an explicit tie or an index not among the candidates.
fn parse_winner(content: &str, candidates: &[Candidate]) -> Option<u32> {
    let valid = |n: u32| candidates.iter().any(|c| c.index == n);

    if let Some(start) = content.find('{') {
        if let Some(end) = content.rfind('}') {
            if let Ok(value) = serde_json::from_str::<Value>(&content[start..=end]) {
                match &value["winner"] {
                    Value::Number(n) => {
                        let n = n.as_u64()? as u32;
                        return valid(n).then_some(n);
                    }
                    Value::String(s) if s.eq_ignore_ascii_case("tie") => return None,
                    Value::String(s) => {
                        if let Ok(n) = s.parse::<u32>() {
                            return valid(n).then_some(n);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    // First standalone integer in the prose
    let re = regex::Regex::new(r"\b(\d+)\b").ok()?;
    let n: u32 = re.captures(content)?.get(1)?.as_str().parse().ok()?;
    valid(n).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelTurn;
    use crate::llm::client::mock::MockModelClient;

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate {
                index: 0,
                content: "apple".to_string(),
                cost: 0.03,
            },
            Candidate {
                index: 1,
                content: "banana".to_string(),
                cost: 0.01,
            },
            Candidate {
                index: 2,
                content: "cherry".to_string(),
                cost: 0.02,
            },
        ]
    }

    fn client_with(turns: Vec<ModelTurn>) -> Arc<dyn ModelClient> {
        Arc::new(MockModelClient::new(turns))
    }

    #[tokio::test]
    async fn test_model_verdict_selects_winner() {
        let client = client_with(vec![ModelTurn::text(
            r#"{"winner": 1, "reasoning": "banana is most specific"}"#,
        )]);
        let spec = EvaluatorSpec::default();
        let selection = select_winner(&client, "stub/eval", Some(&spec), &candidates()).await;
        assert_eq!(selection.winner_index, 1);
        assert!(selection.model.is_some());
    }

    #[tokio::test]
    async fn test_tie_falls_back_to_rule() {
        let client = client_with(vec![ModelTurn::text(r#"{"winner": "tie", "reasoning": "equal"}"#)]);
        let spec = EvaluatorSpec {
            tie_break: TieBreak::LowestCost,
            ..Default::default()
        };
        let selection = select_winner(&client, "stub/eval", Some(&spec), &candidates()).await;
        assert_eq!(selection.winner_index, 1); // lowest cost
        assert!(selection.model.is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_verdict_tie_breaks() {
        let client = client_with(vec![ModelTurn::text(r#"{"winner": 9}"#)]);
        let spec = EvaluatorSpec::default();
        let selection = select_winner(&client, "stub/eval", Some(&spec), &candidates()).await;
        assert_eq!(selection.winner_index, 0); // first in order
    }

    #[tokio::test]
    async fn test_no_evaluator_uses_tie_break() {
        let client = client_with(vec![]);
        let selection = select_winner(&client, "stub/eval", None, &candidates()).await;
        assert_eq!(selection.winner_index, 0);
    }

    #[tokio::test]
    async fn test_single_candidate_short_circuit() {
        let client = client_with(vec![]);
        let only = vec![candidates().remove(2)];
        let selection = select_winner(&client, "stub/eval", None, &only).await;
        assert_eq!(selection.winner_index, 2);
    }

    #[test]
    fn test_parse_winner_prose_fallback() {
        let c = candidates();
        assert_eq!(parse_winner("The best is candidate 2, clearly.", &c), Some(2));
        assert_eq!(parse_winner("no verdict here", &c), None);
    }
}
