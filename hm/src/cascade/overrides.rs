//! Caller-supplied cascade overrides
//!
//! External invokers (the SQL surface, UIs, test harnesses) can adjust a
//! cascade without editing its definition. Two formats are accepted:
//!
//! - Structured: `{cascade_overrides: {...}, cell_overrides: {default: {...},
//!   <cell_name>: {...}}}` - deep-merged onto the cascade / every phase /
//!   the named phase respectively.
//! - Legacy flat: a bare object of cascade-level keys (`takes`, `narrator`,
//!   `token_budget`, ...) plus `model`, which broadcasts to every phase.

use serde_json::Value;
use tracing::debug;

use super::config::CascadeConfig;
use super::loader::ConfigError;

/// Deep-merge `patch` into `target`: objects merge key-wise recursively,
/// everything else replaces.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, patch_value),
                    None => {
                        target_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Apply caller overrides to a loaded config.
pub fn apply_overrides(config: CascadeConfig, overrides: &Value) -> Result<CascadeConfig, ConfigError> {
    let overrides_map = match overrides.as_object() {
        Some(map) if !map.is_empty() => map,
        _ => return Ok(config),
    };
    debug!(cascade_id = %config.cascade_id, keys = ?overrides_map.keys().collect::<Vec<_>>(), "apply_overrides");

    let structured = overrides_map.contains_key("cascade_overrides") || overrides_map.contains_key("cell_overrides");

    let mut config_value = serde_json::to_value(&config).map_err(|e| ConfigError::Parse(e.to_string()))?;

    if structured {
        if let Some(cascade_patch) = overrides_map.get("cascade_overrides") {
            deep_merge(&mut config_value, cascade_patch);
        }
        if let Some(cell_patches) = overrides_map.get("cell_overrides").and_then(|v| v.as_object()) {
            let default_patch = cell_patches.get("default").cloned();
            if let Some(phases) = config_value.get_mut("phases").and_then(|v| v.as_array_mut()) {
                for phase in phases.iter_mut() {
                    if let Some(default_patch) = &default_patch {
                        deep_merge(phase, default_patch);
                    }
                    let name = phase.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    if let Some(named_patch) = cell_patches.get(&name) {
                        deep_merge(phase, named_patch);
                    }
                }
            }
        }
    } else {
        // Legacy flat form
        for (key, value) in overrides_map {
            match key.as_str() {
                // Broadcast to every phase
                "model" => {
                    if let Some(phases) = config_value.get_mut("phases").and_then(|v| v.as_array_mut()) {
                        for phase in phases.iter_mut() {
                            phase["model"] = value.clone();
                        }
                    }
                }
                // Shorthand for cascade-level soundings factor
                "factor" => {
                    let takes = &mut config_value["takes"];
                    if takes.is_null() {
                        *takes = serde_json::json!({"factor": value});
                    } else {
                        takes["factor"] = value.clone();
                    }
                }
                // Cascade-level keys merge directly
                _ => {
                    deep_merge(&mut config_value[key.as_str()], value);
                }
            }
        }
    }

    let merged: CascadeConfig =
        serde_json::from_value(config_value).map_err(|e| ConfigError::Parse(format!("after overrides: {e}")))?;
    super::loader::validate_config(&merged)?;
    Ok(merged)
}
