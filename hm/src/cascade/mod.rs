//! Cascade configuration: types, loading, validation and overrides

mod config;
mod loader;
mod overrides;

pub use config::{
    CascadeConfig, EvaluatorSpec, HANDOFF_PASS, HANDOFF_STOP, HandoffSpec, MutationMode, NarratorConfig, PhaseConfig,
    ReforgeConfig, Rules, SoundingsConfig, SubCascadeSpec, TackleSpec, TieBreak, WardMode, WardSpec, WardsConfig,
};
pub use loader::{ConfigError, ConfigSource, load_config, validate_config};
pub use overrides::{apply_overrides, deep_merge};
