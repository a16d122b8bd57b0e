//! Declarative cascade configuration types
//!
//! A cascade is an ordered list of phases; each phase carries its prompt
//! template, model spec, tackle (tools), rules, wards, optional soundings /
//! reforge blocks and handoff declarations. Configs load from JSON or YAML.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handoff sentinel: terminate the cascade
pub const HANDOFF_STOP: &str = "STOP";

/// Handoff sentinel: fall through to the next declared phase
pub const HANDOFF_PASS: &str = "PASS";

/// Top-level cascade description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    pub cascade_id: String,

    #[serde(default)]
    pub description: String,

    /// JSON-schema-like description of expected inputs
    #[serde(default)]
    pub inputs_schema: Option<Value>,

    pub phases: Vec<PhaseConfig>,

    #[serde(default)]
    pub narrator: Option<NarratorConfig>,

    /// Cascade-level soundings: run the whole cascade N times, pick a winner
    #[serde(default)]
    pub takes: Option<SoundingsConfig>,

    #[serde(default)]
    pub token_budget: Option<u64>,

    /// Opaque pass-through for external context-selection collaborators
    #[serde(default)]
    pub auto_context: Option<Value>,

    /// Opaque pass-through for external memory collaborators
    #[serde(default)]
    pub memory: Option<Value>,

    #[serde(default)]
    pub max_parallel: Option<usize>,
}

impl CascadeConfig {
    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }
}

/// One phase (cell) of a cascade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,

    /// Prompt template rendered with `{input, state, outputs, lineage, this}`
    #[serde(default)]
    pub instructions: String,

    /// Model spec, optionally with a `::reasoning` suffix
    #[serde(default)]
    pub model: Option<String>,

    /// Tool list, or `"manifest"` for quartermaster selection
    #[serde(default, alias = "tools")]
    pub tackle: Option<TackleSpec>,

    #[serde(default)]
    pub rules: Rules,

    #[serde(default)]
    pub output_schema: Option<Value>,

    #[serde(default)]
    pub wards: WardsConfig,

    #[serde(default)]
    pub soundings: Option<SoundingsConfig>,

    #[serde(default)]
    pub handoffs: Option<Vec<HandoffSpec>>,

    #[serde(default)]
    pub sub_cascades: Vec<SubCascadeSpec>,

    /// Opaque context-policy pass-throughs
    #[serde(default)]
    pub intra_context: Option<Value>,
    #[serde(default)]
    pub context: Option<Value>,

    #[serde(default = "default_true")]
    pub use_native_tools: bool,
}

fn default_true() -> bool {
    true
}

/// Tool availability for a phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TackleSpec {
    /// `"manifest"`: the quartermaster picks a subset of the catalog
    Mode(String),
    /// Explicit tool names
    List(Vec<String>),
}

impl TackleSpec {
    pub fn is_manifest(&self) -> bool {
        matches!(self, TackleSpec::Mode(mode) if mode == "manifest")
    }

    pub fn tool_names(&self) -> Vec<String> {
        match self {
            TackleSpec::List(names) => names.clone(),
            TackleSpec::Mode(_) => Vec::new(),
        }
    }
}

/// Per-phase execution rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Rules {
    pub max_turns: u32,
    pub max_attempts: u32,
    /// Validator evaluated after each turn; satisfying it ends the turn loop
    pub loop_until: Option<String>,
    /// Phase deadline in milliseconds
    pub timeout_ms: Option<u64>,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            max_turns: 1,
            max_attempts: 1,
            loop_until: None,
            timeout_ms: None,
        }
    }
}

/// Pre/post validator declarations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardsConfig {
    pub pre: Vec<WardSpec>,
    pub post: Vec<WardSpec>,
}

/// One validator attached to a phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardSpec {
    pub name: String,

    /// Builtin validator name, or `model` for a model-judged check
    pub validator: String,

    #[serde(default)]
    pub mode: WardMode,

    /// Instructions for model-judged validators
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WardMode {
    /// Failure aborts the cascade
    Blocking,
    /// Failure re-runs the phase body up to `max_attempts`
    #[default]
    Retry,
    /// Failure is logged and execution continues
    Advisory,
}

impl WardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WardMode::Blocking => "blocking",
            WardMode::Retry => "retry",
            WardMode::Advisory => "advisory",
        }
    }
}

/// Parallel exploratory sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundingsConfig {
    pub factor: u32,

    #[serde(default)]
    pub evaluator: Option<EvaluatorSpec>,

    #[serde(default)]
    pub mutate: Option<MutationMode>,

    #[serde(default)]
    pub max_parallel: Option<usize>,

    #[serde(default)]
    pub reforge: Option<ReforgeConfig>,
}

/// How non-baseline attempts vary their prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationMode {
    Augment,
    Rewrite,
    None,
}

impl MutationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationMode::Augment => "augment",
            MutationMode::Rewrite => "rewrite",
            MutationMode::None => "none",
        }
    }
}

/// Winner-selection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSpec {
    pub model: Option<String>,
    pub instructions: Option<String>,
    pub tie_break: TieBreak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    FirstInOrder,
    LowestCost,
}

/// Sequential refinement over a soundings winner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReforgeConfig {
    #[serde(alias = "rounds")]
    pub steps: u32,

    #[serde(default = "default_factor_per_step")]
    pub factor_per_step: u32,

    #[serde(default)]
    pub evaluator: Option<EvaluatorSpec>,
}

fn default_factor_per_step() -> u32 {
    2
}

/// Phase transition declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandoffSpec {
    Target(String),
    Conditional {
        target: String,
        #[serde(default)]
        when: Option<String>,
    },
}

impl HandoffSpec {
    pub fn target(&self) -> &str {
        match self {
            HandoffSpec::Target(t) => t,
            HandoffSpec::Conditional { target, .. } => target,
        }
    }
}

/// A sub-cascade spawned by a phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubCascadeSpec {
    /// Cascade id (registered) or config path
    pub cascade: String,

    #[serde(default)]
    pub inputs: Option<Value>,
}

/// Narrator service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NarratorConfig {
    pub model: Option<String>,
    pub instructions: Option<String>,
    pub on_events: Option<Vec<String>>,
    pub min_interval_seconds: f64,
}

impl Default for NarratorConfig {
    fn default() -> Self {
        Self {
            model: None,
            instructions: None,
            on_events: None,
            min_interval_seconds: 20.0,
        }
    }
}

impl NarratorConfig {
    /// Event types the narrator reacts to (default: phase completions)
    pub fn effective_on_events(&self) -> Vec<String> {
        self.on_events
            .clone()
            .unwrap_or_else(|| vec!["phase_complete".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_cascade_from_yaml() {
        let yaml = r#"
cascade_id: echo_test
phases:
  - name: echo
    instructions: "Echo: {{ input.x }}"
"#;
        let config: CascadeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cascade_id, "echo_test");
        assert_eq!(config.phases.len(), 1);
        assert_eq!(config.phases[0].rules.max_turns, 1);
        assert_eq!(config.phases[0].rules.max_attempts, 1);
        assert!(config.phases[0].use_native_tools);
    }

    #[test]
    fn test_tackle_accepts_list_and_manifest() {
        let yaml = r#"
name: p
tackle: [set_state, fire_signal]
"#;
        let phase: PhaseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            phase.tackle.as_ref().unwrap().tool_names(),
            vec!["set_state", "fire_signal"]
        );

        let yaml = r#"
name: p
tackle: manifest
"#;
        let phase: PhaseConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(phase.tackle.as_ref().unwrap().is_manifest());
    }

    #[test]
    fn test_tools_alias() {
        let yaml = r#"
name: p
tools: [say]
"#;
        let phase: PhaseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(phase.tackle.as_ref().unwrap().tool_names(), vec!["say"]);
    }

    #[test]
    fn test_ward_mode_parsing() {
        let yaml = r#"
name: json_check
validator: is_json
mode: blocking
"#;
        let ward: WardSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ward.mode, WardMode::Blocking);

        // Default mode is retry
        let yaml = r#"
name: check
validator: non_empty
"#;
        let ward: WardSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ward.mode, WardMode::Retry);
    }

    #[test]
    fn test_soundings_with_reforge() {
        let yaml = r#"
factor: 3
mutate: augment
reforge:
  rounds: 2
  factor_per_step: 2
"#;
        let soundings: SoundingsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(soundings.factor, 3);
        assert_eq!(soundings.mutate, Some(MutationMode::Augment));
        let reforge = soundings.reforge.unwrap();
        assert_eq!(reforge.steps, 2);
        assert_eq!(reforge.factor_per_step, 2);
    }

    #[test]
    fn test_handoff_forms() {
        let yaml = r#"
- path_a
- target: path_b
  when: "score < 0.5"
"#;
        let handoffs: Vec<HandoffSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(handoffs[0].target(), "path_a");
        assert_eq!(handoffs[1].target(), "path_b");
    }

    #[test]
    fn test_narrator_defaults() {
        let narrator = NarratorConfig::default();
        assert_eq!(narrator.min_interval_seconds, 20.0);
        assert_eq!(narrator.effective_on_events(), vec!["phase_complete"]);
    }
}
