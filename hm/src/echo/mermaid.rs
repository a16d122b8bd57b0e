//! Mermaid state-diagram snapshots of session progress
//!
//! Every history entry carries a cumulative diagram so any point in the log
//! can be visualised without replaying the session. The generator walks the
//! phase entries recorded so far; failed phases get the `blocked` class and a
//! terminator.

use serde_json::Value;

use super::ErrorEntry;

/// Render the session's progress as a Mermaid `stateDiagram-v2` string.
///
/// Returns `None` when there is nothing to draw yet.
pub fn state_diagram(history: &[Value], errors: &[ErrorEntry]) -> Option<String> {
    let mut phases: Vec<String> = Vec::new();
    for entry in history {
        if entry.get("node_type").and_then(|v| v.as_str()) != Some("phase") {
            continue;
        }
        let name = entry
            .pointer("/metadata/phase_name")
            .and_then(|v| v.as_str())
            .unwrap_or("phase");
        if phases.last().map(|p| p.as_str()) != Some(name) {
            phases.push(name.to_string());
        }
    }

    if phases.is_empty() {
        return None;
    }

    let failed: Vec<&str> = errors.iter().map(|e| e.phase.as_str()).collect();

    let mut lines = vec![
        "stateDiagram-v2".to_string(),
        "    classDef blocked fill:#f55,stroke:#900".to_string(),
    ];
    lines.push(format!("    [*] --> {}", sanitize(&phases[0])));
    for pair in phases.windows(2) {
        lines.push(format!("    {} --> {}", sanitize(&pair[0]), sanitize(&pair[1])));
    }

    if let Some(last_raw) = phases.last() {
        let last = sanitize(last_raw);
        lines.push(format!("    {last} --> [*]"));
        if failed.contains(&last_raw.as_str()) {
            // ⛔ terminator marks the failed phase
            lines.push(format!("    class {last} blocked"));
        }
    }

    Some(lines.join("\n"))
}

/// Mermaid identifiers cannot carry spaces or punctuation
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn phase_entry(name: &str) -> Value {
        json!({"node_type": "phase", "metadata": {"phase_name": name}})
    }

    #[test]
    fn test_empty_history_yields_none() {
        assert!(state_diagram(&[], &[]).is_none());
    }

    #[test]
    fn test_sequential_phases() {
        let history = vec![phase_entry("draft"), phase_entry("review")];
        let diagram = state_diagram(&history, &[]).unwrap();
        assert!(diagram.starts_with("stateDiagram-v2"));
        assert!(diagram.contains("[*] --> draft"));
        assert!(diagram.contains("draft --> review"));
        assert!(diagram.contains("review --> [*]"));
        assert!(!diagram.contains("class review blocked"));
    }

    #[test]
    fn test_failed_phase_marked_blocked() {
        let history = vec![phase_entry("draft")];
        let errors = vec![ErrorEntry {
            phase: "draft".to_string(),
            error_type: "ward_block".to_string(),
            error_message: "not json".to_string(),
            metadata: json!({}),
        }];
        let diagram = state_diagram(&history, &errors).unwrap();
        assert!(diagram.contains("class draft blocked"));
    }

    #[test]
    fn test_identifiers_sanitized() {
        let history = vec![phase_entry("my phase-1")];
        let diagram = state_diagram(&history, &[]).unwrap();
        assert!(diagram.contains("my_phase_1"));
    }
}
