//! Ward engine - validators around a phase body
//!
//! Wards run in declared order before (pre) and after (post) the phase
//! body. A failing ward reacts per its mode: `blocking` aborts the cascade,
//! `retry` re-runs the body, `advisory` logs and continues. A blocking
//! failure short-circuits the remaining wards of the same stage.
//!
//! Validators are builtin checks (`is_json`, `non_empty`, `is_number`,
//! `regex:<pattern>`, `min_length:<n>`), or `model` for a model-judged
//! check driven by the ward's `instructions`. The same validators back
//! `rules.loop_until`.

use std::sync::Arc;

use logstore::NodeType;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cascade::{WardMode, WardSpec};
use crate::echo::{Echo, HistoryOptions};
use crate::llm::{ChatRequest, ModelClient};

/// One validator's judgement
#[derive(Debug, Clone)]
pub struct WardOutcome {
    pub valid: bool,
    pub reason: Option<String>,
}

impl WardOutcome {
    pub fn pass() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Which side of the body a ward runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WardStage {
    Pre,
    Post,
}

impl WardStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WardStage::Pre => "pre",
            WardStage::Post => "post",
        }
    }

    fn node_type(&self) -> NodeType {
        match self {
            WardStage::Pre => NodeType::PreWard,
            WardStage::Post => NodeType::PostWard,
        }
    }
}

/// A completed ward check, as logged
#[derive(Debug, Clone)]
pub struct WardRecord {
    pub phase_name: String,
    pub ward_type: WardStage,
    pub name: String,
    pub validator: String,
    pub mode: WardMode,
    pub valid: bool,
    pub reason: Option<String>,
}

/// Result of running one stage's wards
#[derive(Debug, Clone)]
pub enum WardVerdict {
    Pass,
    /// A retry-mode ward failed; re-run the body if attempts remain
    Retry(WardRecord),
    /// A blocking ward failed; the phase and cascade fail
    Block(WardRecord),
}

pub struct WardEngine {
    client: Arc<dyn ModelClient>,
    judge_model: String,
}

impl WardEngine {
    pub fn new(client: Arc<dyn ModelClient>, judge_model: impl Into<String>) -> Self {
        Self {
            client,
            judge_model: judge_model.into(),
        }
    }

    /// Run a stage's wards in declared order, logging each check.
    pub async fn run_stage(
        &self,
        stage: WardStage,
        specs: &[WardSpec],
        payload: &Value,
        phase_name: &str,
        echo: &Echo,
        parent_trace: Option<&str>,
    ) -> WardVerdict {
        debug!(stage = stage.as_str(), count = specs.len(), %phase_name, "WardEngine::run_stage");
        let mut first_retry: Option<WardRecord> = None;

        for spec in specs {
            let outcome = self.evaluate(&spec.validator, spec.instructions.as_deref(), payload).await;
            let record = WardRecord {
                phase_name: phase_name.to_string(),
                ward_type: stage,
                name: spec.name.clone(),
                validator: spec.validator.clone(),
                mode: spec.mode,
                valid: outcome.valid,
                reason: outcome.reason.clone(),
            };
            log_ward(echo, &record, parent_trace);

            if record.valid {
                continue;
            }
            match record.mode {
                // Blocking failure short-circuits the rest of the stage
                WardMode::Blocking => return WardVerdict::Block(record),
                WardMode::Retry => {
                    if first_retry.is_none() {
                        first_retry = Some(record);
                    }
                }
                WardMode::Advisory => {
                    warn!(ward = %record.name, reason = ?record.reason, "advisory ward failed");
                }
            }
        }

        match first_retry {
            Some(record) => WardVerdict::Retry(record),
            None => WardVerdict::Pass,
        }
    }

    /// Evaluate a single validator against a payload. Also used for
    /// `loop_until`.
    pub async fn evaluate(&self, validator: &str, instructions: Option<&str>, payload: &Value) -> WardOutcome {
        debug!(%validator, "WardEngine::evaluate");
        let text = payload_text(payload);

        match validator {
            "is_json" => match serde_json::from_str::<Value>(text.trim()) {
                Ok(_) => WardOutcome::pass(),
                Err(e) => WardOutcome::fail(format!("not valid JSON: {e}")),
            },
            "non_empty" => {
                if text.trim().is_empty() {
                    WardOutcome::fail("output is empty")
                } else {
                    WardOutcome::pass()
                }
            }
            "is_number" => {
                if text.trim().parse::<f64>().is_ok() {
                    WardOutcome::pass()
                } else {
                    WardOutcome::fail("output is not a number")
                }
            }
            "model" => self.judge(instructions, &text).await,
            other => {
                if let Some(pattern) = other.strip_prefix("regex:") {
                    return match regex::Regex::new(pattern) {
                        Ok(re) if re.is_match(&text) => WardOutcome::pass(),
                        Ok(_) => WardOutcome::fail(format!("output does not match /{pattern}/")),
                        Err(e) => WardOutcome::fail(format!("invalid ward pattern: {e}")),
                    };
                }
                if let Some(min) = other.strip_prefix("min_length:") {
                    return match min.parse::<usize>() {
                        Ok(min) if text.chars().count() >= min => WardOutcome::pass(),
                        Ok(min) => WardOutcome::fail(format!("output shorter than {min} chars")),
                        Err(_) => WardOutcome::fail(format!("invalid min_length in validator: {other}")),
                    };
                }
                // Unknown validators fail safe rather than silently passing
                WardOutcome::fail(format!("unknown validator: {other}"))
            }
        }
    }

    async fn judge(&self, instructions: Option<&str>, text: &str) -> WardOutcome {
        let Some(instructions) = instructions else {
            return WardOutcome::fail("model validator declared without instructions");
        };

        let system = "You are a strict validator. Judge the submitted output against the \
                      criteria. Respond with a JSON object: {\"valid\": true|false, \"reason\": \"...\"}.";
        let user = format!("## Criteria\n{instructions}\n\n## Output to judge\n{text}");
        let request = ChatRequest::new(self.judge_model.as_str(), system).with_user(user);

        match self.client.run(request).await {
            Ok(turn) => parse_judgement(&turn.content),
            Err(e) => WardOutcome::fail(format!("validator model call failed: {e}")),
        }
    }
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_judgement(content: &str) -> WardOutcome {
    if let Some(start) = content.find('{') {
        if let Some(end) = content.rfind('}') {
            if let Ok(value) = serde_json::from_str::<Value>(&content[start..=end]) {
                if let Some(valid) = value["valid"].as_bool() {
                    return WardOutcome {
                        valid,
                        reason: value["reason"].as_str().map(String::from),
                    };
                }
            }
        }
    }
    // Fall back to a yes/no reading of the first word
    let lowered = content.trim().to_lowercase();
    if lowered.starts_with("yes") || lowered.starts_with("valid") || lowered.starts_with("pass") {
        return WardOutcome::pass();
    }
    let preview: String = content.chars().take(120).collect();
    WardOutcome::fail(format!("unparseable judgement: {preview}"))
}

fn log_ward(echo: &Echo, record: &WardRecord, parent_trace: Option<&str>) {
    let entry = json!({
        "role": "system",
        "content": {
            "ward": record.name,
            "validator": record.validator,
            "mode": record.mode.as_str(),
            "valid": record.valid,
            "reason": record.reason,
        }
    });
    let mut opts = HistoryOptions::node(record.ward_type.node_type())
        .with_meta("phase_name", json!(record.phase_name))
        .with_meta("ward_name", json!(record.name))
        .with_meta("ward_mode", json!(record.mode.as_str()))
        .with_meta("valid", json!(record.valid))
        .with_meta("semantic_actor", json!("validator"));
    if let Some(parent) = parent_trace {
        opts = opts.with_parent(parent);
    }
    echo.add_history(&entry, opts);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelTurn;
    use crate::llm::client::mock::MockModelClient;

    fn engine_with(responses: Vec<ModelTurn>) -> WardEngine {
        WardEngine::new(Arc::new(MockModelClient::new(responses)), "stub/judge")
    }

    fn spec(name: &str, validator: &str, mode: WardMode) -> WardSpec {
        WardSpec {
            name: name.to_string(),
            validator: validator.to_string(),
            mode,
            instructions: None,
        }
    }

    #[tokio::test]
    async fn test_builtin_validators() {
        let engine = engine_with(vec![]);
        assert!(engine.evaluate("is_json", None, &json!("{\"a\": 1}")).await.valid);
        assert!(!engine.evaluate("is_json", None, &json!("not json")).await.valid);
        assert!(engine.evaluate("non_empty", None, &json!("x")).await.valid);
        assert!(!engine.evaluate("non_empty", None, &json!("  ")).await.valid);
        assert!(engine.evaluate("is_number", None, &json!("3.25")).await.valid);
        assert!(engine.evaluate("regex:^ok-", None, &json!("ok-42")).await.valid);
        assert!(!engine.evaluate("regex:^ok-", None, &json!("nope")).await.valid);
        assert!(engine.evaluate("min_length:3", None, &json!("abcd")).await.valid);
        assert!(!engine.evaluate("min_length:5", None, &json!("abc")).await.valid);
    }

    #[tokio::test]
    async fn test_unknown_validator_fails_safe() {
        let engine = engine_with(vec![]);
        let outcome = engine.evaluate("mystery_check", None, &json!("x")).await;
        assert!(!outcome.valid);
        assert!(outcome.reason.unwrap().contains("unknown validator"));
    }

    #[tokio::test]
    async fn test_model_judged_ward() {
        let engine = engine_with(vec![ModelTurn::text(
            r#"{"valid": false, "reason": "cites no sources"}"#,
        )]);
        let outcome = engine
            .evaluate("model", Some("must cite sources"), &json!("claim without source"))
            .await;
        assert!(!outcome.valid);
        assert_eq!(outcome.reason.as_deref(), Some("cites no sources"));
    }

    #[tokio::test]
    async fn test_blocking_failure_short_circuits() {
        let engine = engine_with(vec![]);
        let echo = Echo::new("ward-test-1", None);
        let specs = vec![
            spec("a", "is_json", WardMode::Blocking),
            spec("b", "non_empty", WardMode::Blocking),
        ];

        let verdict = engine
            .run_stage(WardStage::Post, &specs, &json!("not json"), "p1", &echo, None)
            .await;
        match verdict {
            WardVerdict::Block(record) => assert_eq!(record.name, "a"),
            other => panic!("expected Block, got {other:?}"),
        }
        // Ward B never ran: only one post_ward entry exists
        let history = echo.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["metadata"]["ward_name"], json!("a"));
    }

    #[tokio::test]
    async fn test_advisory_failure_continues() {
        let engine = engine_with(vec![]);
        let echo = Echo::new("ward-test-2", None);
        let specs = vec![
            spec("advisory_json", "is_json", WardMode::Advisory),
            spec("present", "non_empty", WardMode::Retry),
        ];

        let verdict = engine
            .run_stage(WardStage::Post, &specs, &json!("plain text"), "p1", &echo, None)
            .await;
        assert!(matches!(verdict, WardVerdict::Pass));
        assert_eq!(echo.history().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_failure_reported_after_full_stage() {
        let engine = engine_with(vec![]);
        let echo = Echo::new("ward-test-3", None);
        let specs = vec![
            spec("must_json", "is_json", WardMode::Retry),
            spec("present", "non_empty", WardMode::Retry),
        ];

        let verdict = engine
            .run_stage(WardStage::Post, &specs, &json!("plain"), "p1", &echo, None)
            .await;
        match verdict {
            WardVerdict::Retry(record) => assert_eq!(record.name, "must_json"),
            other => panic!("expected Retry, got {other:?}"),
        }
        // Both wards were evaluated and logged
        assert_eq!(echo.history().len(), 2);
    }

    #[test]
    fn test_parse_judgement_fallbacks() {
        assert!(parse_judgement("Yes, this looks correct.").valid);
        assert!(!parse_judgement("some rambling without verdict").valid);
        assert!(parse_judgement(r#"{"valid": true}"#).valid);
    }
}
