//! Cascade config loading and validation

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::config::{CascadeConfig, HANDOFF_PASS, HANDOFF_STOP};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse cascade config: {0}")]
    Parse(String),

    #[error("Invalid cascade config: {0}")]
    Invalid(String),
}

/// Where a cascade config comes from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Path(PathBuf),
    Inline(Value),
}

impl From<&str> for ConfigSource {
    fn from(path: &str) -> Self {
        ConfigSource::Path(PathBuf::from(path))
    }
}

impl From<Value> for ConfigSource {
    fn from(value: Value) -> Self {
        ConfigSource::Inline(value)
    }
}

/// Load and validate a cascade config from a path or inline value.
///
/// Files parse as YAML (a superset of JSON here, so `.json` works too).
pub fn load_config(source: &ConfigSource) -> Result<CascadeConfig, ConfigError> {
    let config = match source {
        ConfigSource::Path(path) => {
            debug!(path = %path.display(), "load_config: reading file");
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            parse_config(&content)?
        }
        ConfigSource::Inline(value) => {
            debug!("load_config: inline value");
            serde_json::from_value(value.clone()).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
    };
    validate_config(&config)?;
    Ok(config)
}

fn parse_config(content: &str) -> Result<CascadeConfig, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Structural validation: field presence, numeric bounds, handoff targets.
pub fn validate_config(config: &CascadeConfig) -> Result<(), ConfigError> {
    debug!(cascade_id = %config.cascade_id, "validate_config");
    if config.cascade_id.trim().is_empty() {
        return Err(ConfigError::Invalid("cascade_id must not be empty".to_string()));
    }
    if config.phases.is_empty() {
        return Err(ConfigError::Invalid("cascade must declare at least one phase".to_string()));
    }

    let mut seen = std::collections::HashSet::new();
    for phase in &config.phases {
        if phase.name.trim().is_empty() {
            return Err(ConfigError::Invalid("phase name must not be empty".to_string()));
        }
        if !seen.insert(phase.name.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate phase name: {}", phase.name)));
        }
        if phase.rules.max_turns == 0 {
            return Err(ConfigError::Invalid(format!(
                "phase {}: max_turns must be at least 1",
                phase.name
            )));
        }
        if phase.rules.max_attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "phase {}: max_attempts must be at least 1",
                phase.name
            )));
        }
        if let Some(soundings) = &phase.soundings {
            if soundings.factor == 0 {
                return Err(ConfigError::Invalid(format!(
                    "phase {}: soundings factor must be at least 1",
                    phase.name
                )));
            }
            if let Some(reforge) = &soundings.reforge {
                if reforge.factor_per_step == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "phase {}: reforge factor_per_step must be at least 1",
                        phase.name
                    )));
                }
            }
        }
    }

    // Every handoff target must name a declared phase or a sentinel
    for phase in &config.phases {
        if let Some(handoffs) = &phase.handoffs {
            for handoff in handoffs {
                let target = handoff.target();
                if target == HANDOFF_STOP || target == HANDOFF_PASS {
                    continue;
                }
                if config.phase(target).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "phase {}: handoff target '{}' does not exist",
                        phase.name, target
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal(phases: Value) -> Value {
        json!({"cascade_id": "t", "phases": phases})
    }

    #[test]
    fn test_load_inline_json() {
        let config = load_config(&ConfigSource::Inline(minimal(json!([
            {"name": "only", "instructions": "hi"}
        ]))))
        .unwrap();
        assert_eq!(config.phases[0].name, "only");
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cascade.yaml");
        std::fs::write(
            &path,
            "cascade_id: from_file\nphases:\n  - name: p1\n    instructions: x\n",
        )
        .unwrap();

        let config = load_config(&ConfigSource::Path(path)).unwrap();
        assert_eq!(config.cascade_id, "from_file");
    }

    #[test]
    fn test_empty_phases_rejected() {
        let err = load_config(&ConfigSource::Inline(minimal(json!([])))).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duplicate_phase_names_rejected() {
        let err = load_config(&ConfigSource::Inline(minimal(json!([
            {"name": "a"}, {"name": "a"}
        ]))))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_handoff_target_rejected() {
        let err = load_config(&ConfigSource::Inline(minimal(json!([
            {"name": "a", "handoffs": ["missing"]}
        ]))))
        .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_sentinel_handoffs_allowed() {
        let config = load_config(&ConfigSource::Inline(minimal(json!([
            {"name": "a", "handoffs": ["STOP", "PASS"]}
        ]))))
        .unwrap();
        assert_eq!(config.phases[0].handoffs.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let err = load_config(&ConfigSource::Inline(minimal(json!([
            {"name": "a", "rules": {"max_turns": 0}}
        ]))))
        .unwrap_err();
        assert!(err.to_string().contains("max_turns"));

        let err = load_config(&ConfigSource::Inline(minimal(json!([
            {"name": "a", "soundings": {"factor": 0}}
        ]))))
        .unwrap_err();
        assert!(err.to_string().contains("factor"));
    }

    #[test]
    fn test_missing_file_errors() {
        let err = load_config(&ConfigSource::Path(PathBuf::from("/nonexistent/cascade.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
