//! End-to-end cascade scenarios against a deterministic model stub
//!
//! These tests drive full cascades through the assembled runtime and assert
//! on the structured result, the session history, and the universal
//! invariants (lineage consistency, soundings totality, trace-tree shape,
//! message cleanliness).

use std::sync::Arc;

use serde_json::{Value, json};

use helmsman::cascade::ConfigSource;
use helmsman::config::Config;
use helmsman::llm::client::mock::MockModelClient;
use helmsman::llm::{ChatRequest, ModelError, ModelTurn};
use helmsman::runner::RunOptions;
use helmsman::runtime::Runtime;
use logstore::LogStore;

fn test_config() -> Config {
    let mut config = Config::default();
    config.cost.enabled = false;
    config.cards.enabled = false;
    config
}

fn runtime_with(client: Arc<MockModelClient>) -> Runtime {
    let store = Arc::new(LogStore::open_in_memory().unwrap());
    Runtime::assemble(test_config(), client, store, None).unwrap()
}

fn last_user_content(request: &ChatRequest) -> String {
    if let Some(user) = &request.user {
        return user.clone();
    }
    request
        .history
        .iter()
        .rev()
        .find(|m| m["role"] == json!("user"))
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string()
}

fn count_nodes(history: &[Value], node_type: &str) -> usize {
    history
        .iter()
        .filter(|e| e["node_type"] == json!(node_type))
        .count()
}

// =============================================================================
// Scenario A - single-phase echo
// =============================================================================

#[tokio::test]
async fn scenario_a_single_phase_echo() {
    // The stub returns the prompt's final line
    let client = Arc::new(MockModelClient::with_handler(|request| {
        let prompt = last_user_content(request);
        let last_line = prompt.lines().last().unwrap_or_default().to_string();
        Ok(ModelTurn::text(last_line))
    }));
    let runtime = runtime_with(client.clone());

    let cascade = json!({
        "cascade_id": "echo_test",
        "phases": [{
            "name": "echo",
            "instructions": "Echo: {{ input.x }}",
            "rules": {"max_turns": 1}
        }]
    });

    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({"x": "hello"}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, "success");
    assert!(!result.has_errors);
    assert_eq!(result.lineage.len(), 1);
    assert_eq!(result.lineage[0].phase, "echo");
    assert!(result.state["echo"].as_str().unwrap().contains("hello"));
    assert_eq!(count_nodes(&result.history, "phase"), 1);
    assert_eq!(count_nodes(&result.history, "turn"), 1);

    // Message cleanliness: nothing sent to the model carried trace fields
    for request in client.requests() {
        for message in &request.history {
            for forbidden in ["trace_id", "parent_id", "node_type", "metadata"] {
                assert!(
                    message.get(forbidden).is_none(),
                    "outbound message leaked {forbidden}"
                );
            }
        }
    }
}

// =============================================================================
// Scenario B - blocking post-ward
// =============================================================================

#[tokio::test]
async fn scenario_b_blocking_post_ward() {
    let client = Arc::new(MockModelClient::with_handler(|_| Ok(ModelTurn::text("not JSON"))));
    let runtime = runtime_with(client);

    let cascade = json!({
        "cascade_id": "ward_block_test",
        "phases": [
            {
                "name": "p1",
                "instructions": "Produce JSON",
                "wards": {"post": [{"name": "json_check", "validator": "is_json", "mode": "blocking"}]}
            },
            {"name": "p2", "instructions": "Never reached"}
        ]
    });

    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, "failed");
    assert!(result.has_errors);
    assert_eq!(result.errors[0].phase, "p1");
    assert_eq!(result.errors[0].error_type, "ward_block");

    // p2 never ran
    assert!(result.lineage.iter().all(|entry| entry.phase != "p2"));
    assert_eq!(count_nodes(&result.history, "phase"), 1);

    // The failing ward was logged with its mode
    let ward_entries: Vec<&Value> = result
        .history
        .iter()
        .filter(|e| e["node_type"] == json!("post_ward"))
        .collect();
    assert_eq!(ward_entries.len(), 1);
    assert_eq!(ward_entries[0]["content"]["valid"], json!(false));
    assert_eq!(ward_entries[0]["content"]["mode"], json!("blocking"));

    // A failed phase never reaches lineage
    assert!(result.lineage.is_empty());
}

// =============================================================================
// Scenario C - retry ward succeeds on second attempt
// =============================================================================

#[tokio::test]
async fn scenario_c_retry_ward_second_attempt() {
    let client = Arc::new(MockModelClient::new(vec![
        ModelTurn::text(""),
        ModelTurn::text("x"),
    ]));
    let runtime = runtime_with(client.clone());

    let cascade = json!({
        "cascade_id": "retry_test",
        "phases": [{
            "name": "p1",
            "instructions": "Say something",
            "rules": {"max_attempts": 3},
            "wards": {"post": [{"name": "present", "validator": "non_empty", "mode": "retry"}]}
        }]
    });

    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, "success");
    // Exactly two body attempts hit the model
    assert_eq!(client.call_count(), 2);
    assert_eq!(result.state["p1"], json!("x"));

    let ward_entries: Vec<&Value> = result
        .history
        .iter()
        .filter(|e| e["node_type"] == json!("post_ward"))
        .collect();
    assert_eq!(ward_entries.len(), 2);
    assert_eq!(ward_entries[0]["content"]["valid"], json!(false));
    assert_eq!(ward_entries[1]["content"]["valid"], json!(true));
}

// =============================================================================
// Scenario D - soundings with three attempts
// =============================================================================

#[tokio::test]
async fn scenario_d_soundings_three_attempts() {
    let client = Arc::new(MockModelClient::with_handler(|request| {
        if request.system.contains("evaluator") {
            return Ok(ModelTurn::text(r#"{"winner": 1, "reasoning": "banana is ripest"}"#));
        }
        let prompt = last_user_content(request);
        // Augment mutations rotate through known variation instructions;
        // attempt 0 is the unmutated baseline
        if prompt.contains("unconventional angle") {
            Ok(ModelTurn::text("banana"))
        } else if prompt.contains("brevity") {
            Ok(ModelTurn::text("cherry"))
        } else {
            Ok(ModelTurn::text("apple"))
        }
    }));
    let runtime = runtime_with(client);

    let cascade = json!({
        "cascade_id": "soundings_test",
        "phases": [{
            "name": "probe",
            "instructions": "Name a fruit",
            "soundings": {"factor": 3, "mutate": "augment", "evaluator": {}}
        }]
    });

    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, "success");
    assert_eq!(result.state["probe"], json!("banana"));

    // Soundings totality: exactly N attempts, exactly one winner
    let attempts: Vec<&Value> = result
        .history
        .iter()
        .filter(|e| e["node_type"] == json!("sounding_attempt"))
        .collect();
    assert_eq!(attempts.len(), 3);
    let indices: std::collections::HashSet<i64> = attempts
        .iter()
        .filter_map(|e| e["metadata"]["sounding_index"].as_i64())
        .collect();
    assert_eq!(indices, [0, 1, 2].into_iter().collect());

    let winners: Vec<&&Value> = attempts
        .iter()
        .filter(|e| e["metadata"]["is_winner"] == json!(true))
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0]["metadata"]["sounding_index"], json!(1));

    assert_eq!(count_nodes(&result.history, "evaluator"), 1);
}

// =============================================================================
// Scenario E - reforge refines the soundings winner
// =============================================================================

#[tokio::test]
async fn scenario_e_reforge_refines_winner() {
    let client = Arc::new(MockModelClient::with_handler(|request| {
        let user = last_user_content(request);
        if request.system.contains("evaluator") {
            // Pick the candidate whose content is a version marker
            let winner = version_marker_candidate(&user);
            return Ok(ModelTurn::text(format!(
                r#"{{"winner": {winner}, "reasoning": "newer version"}}"#
            )));
        }
        // Refinement rounds embed the prior winner; diversified attempts
        // carry an "Additionally" rider and produce junk
        let output = if user.contains("Previous answer:\nv2") {
            if user.contains("Additionally") { "junk" } else { "v3" }
        } else if user.contains("Previous answer:\nv1") {
            if user.contains("Additionally") { "junk" } else { "v2" }
        } else {
            "v1"
        };
        Ok(ModelTurn::text(output))
    }));
    let runtime = runtime_with(client);

    let cascade = json!({
        "cascade_id": "reforge_test",
        "phases": [{
            "name": "forge",
            "instructions": "Draft the answer",
            "soundings": {
                "factor": 1,
                "evaluator": {},
                "reforge": {"steps": 2, "factor_per_step": 2, "evaluator": {}}
            }
        }]
    });

    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, "success");
    assert_eq!(result.state["forge"], json!("v3"));

    // Two reforge rounds, two attempts each
    let reforge_attempts: Vec<&Value> = result
        .history
        .iter()
        .filter(|e| {
            e["node_type"] == json!("sounding_attempt") && e["metadata"]["reforge_step"].is_i64()
        })
        .collect();
    assert_eq!(reforge_attempts.len(), 4);
    let steps: std::collections::HashSet<i64> = reforge_attempts
        .iter()
        .filter_map(|e| e["metadata"]["reforge_step"].as_i64())
        .collect();
    assert_eq!(steps, [1, 2].into_iter().collect());
}

/// Find the candidate index whose content is a bare version marker (`vN`)
fn version_marker_candidate(user: &str) -> u32 {
    let mut current_index = 0u32;
    let mut lines = user.lines().peekable();
    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("### Candidate ") {
            if let Some(n) = rest.split_whitespace().next().and_then(|s| s.parse::<u32>().ok()) {
                current_index = n;
            }
            if let Some(content) = lines.peek() {
                let content = content.trim();
                if content.len() >= 2 && content.starts_with('v') && content[1..].chars().all(|c| c.is_ascii_digit())
                {
                    return current_index;
                }
            }
        }
    }
    0
}

// =============================================================================
// Scenario F - dynamic handoff
// =============================================================================

#[tokio::test]
async fn scenario_f_dynamic_handoff() {
    let client = Arc::new(MockModelClient::with_handler(|request| {
        if request.system.contains("routing a workflow") {
            return Ok(ModelTurn::text("path_a"));
        }
        let prompt = last_user_content(request);
        if prompt.contains("Classify") {
            Ok(ModelTurn::text("looks like an A"))
        } else if prompt.contains("path A") {
            Ok(ModelTurn::text("A handled"))
        } else {
            Ok(ModelTurn::text("B handled"))
        }
    }));
    let runtime = runtime_with(client);

    let cascade = json!({
        "cascade_id": "routing_test",
        "phases": [
            {"name": "classify", "instructions": "Classify the request", "handoffs": ["path_a", "path_b"]},
            {"name": "path_a", "instructions": "Handle path A", "handoffs": ["STOP"]},
            {"name": "path_b", "instructions": "Handle path B", "handoffs": ["STOP"]}
        ]
    });

    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, "success");

    // The taken path is recorded in lineage
    let phases: Vec<&str> = result.lineage.iter().map(|e| e.phase.as_str()).collect();
    assert_eq!(phases, vec!["classify", "path_a"]);
    assert!(
        result.lineage[0]
            .output
            .as_str()
            .unwrap()
            .contains("Dynamically routed to: path_a")
    );

    // path_b never executed
    assert!(
        !result
            .history
            .iter()
            .any(|e| e["node_type"] == json!("phase") && e["metadata"]["phase_name"] == json!("path_b"))
    );
}

// =============================================================================
// Universal invariants
// =============================================================================

#[tokio::test]
async fn invariant_trace_tree_well_formed() {
    let client = Arc::new(MockModelClient::with_handler(|_| Ok(ModelTurn::text("done"))));
    let runtime = runtime_with(client);

    let cascade = json!({
        "cascade_id": "trace_test",
        "phases": [
            {"name": "one", "instructions": "First"},
            {"name": "two", "instructions": "Second"}
        ]
    });

    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({}), RunOptions::default())
        .await
        .unwrap();

    // Every non-null parent_id refers to an entry in the same history
    let trace_ids: std::collections::HashSet<&str> = result
        .history
        .iter()
        .filter_map(|e| e["trace_id"].as_str())
        .collect();
    for entry in &result.history {
        if let Some(parent) = entry["parent_id"].as_str() {
            assert!(trace_ids.contains(parent), "dangling parent_id {parent}");
        }
    }

    // Lineage consistency: every lineage entry's trace_id is in history
    for entry in &result.lineage {
        let trace_id = entry.trace_id.as_deref().unwrap();
        assert!(trace_ids.contains(trace_id), "lineage trace {trace_id} missing");
    }
}

#[tokio::test]
async fn invariant_records_reach_log_store() {
    let client = Arc::new(MockModelClient::with_handler(|_| Ok(ModelTurn::text("logged"))));
    let store = Arc::new(LogStore::open_in_memory().unwrap());
    let runtime = Runtime::assemble(test_config(), client, store.clone(), None).unwrap();

    let cascade = json!({
        "cascade_id": "persist_test",
        "phases": [{"name": "only", "instructions": "Do it"}]
    });

    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({}), RunOptions::default())
        .await
        .unwrap();
    let session_id = result.session_id.clone();

    // The sink drains asynchronously; poll briefly
    let mut records = Vec::new();
    for _ in 0..50 {
        records = store.session_records(&session_id).unwrap();
        if records.len() >= result.history.len() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(!records.is_empty());

    // The cascade node and the agent turn both made it to storage
    assert!(records.iter().any(|r| r.node_type == logstore::NodeType::Cascade));
    assert!(records.iter().any(|r| r.node_type == logstore::NodeType::Agent));
    // Mermaid continuity: later records carry a diagram snapshot
    assert!(records.iter().any(|r| r.mermaid_content.is_some()));
}

#[tokio::test]
async fn invariant_failed_phase_marks_cascade_failed_without_panic() {
    let client = Arc::new(MockModelClient::with_handler(|_| {
        Err(ModelError::InvalidResponse("provider exploded".to_string()))
    }));
    let runtime = runtime_with(client);

    let cascade = json!({
        "cascade_id": "error_test",
        "phases": [{"name": "boom", "instructions": "Try"}]
    });

    // Errors surface as a failed result, not as Err
    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, "failed");
    assert_eq!(result.errors[0].phase, "boom");
    assert_eq!(result.errors[0].error_type, "model_api_error");
    assert!(result.lineage.is_empty());
}

#[tokio::test]
async fn sub_cascade_merges_into_parent() {
    let client = Arc::new(MockModelClient::with_handler(|request| {
        let prompt = last_user_content(request);
        if prompt.contains("inner work") {
            Ok(ModelTurn::text("inner result"))
        } else {
            Ok(ModelTurn::text("outer result"))
        }
    }));
    let runtime = runtime_with(client);

    // Write the sub-cascade to disk; sub_cascades resolve by path
    let dir = tempfile::tempdir().unwrap();
    let sub_path = dir.path().join("inner.yaml");
    std::fs::write(
        &sub_path,
        "cascade_id: inner\nphases:\n  - name: inner_phase\n    instructions: inner work\n",
    )
    .unwrap();

    let cascade = json!({
        "cascade_id": "outer",
        "phases": [{
            "name": "outer_phase",
            "instructions": "outer work",
            "sub_cascades": [{"cascade": sub_path.to_str().unwrap()}]
        }]
    });

    let result = runtime
        .runner
        .run(ConfigSource::Inline(cascade), json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, "success");
    // Child state overlays the parent and child lineage is appended
    assert_eq!(result.state["inner_phase"], json!("inner result"));
    assert!(result.lineage.iter().any(|e| e.phase == "inner_phase"));
    // Child history arrived under a sub_echo marker
    assert!(result.history.iter().any(|e| e.get("sub_echo").is_some()));
}
