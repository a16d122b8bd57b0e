//! Cascade and phase runners

mod cascade;
mod phase;
mod progress;
mod template;

use thiserror::Error;

pub use cascade::{CascadeResult, CascadeRunner, RunOptions};
pub use phase::{HandoffDecision, PhaseOutcome, PhaseServices, parse_prompt_tool_calls, run_phase};
pub use progress::{PROGRESS_STATE_KEY, PhaseProgress, ProgressStage, ProgressTracker, WardProgress};
pub use template::{TemplateContext, render_instructions};

/// Failures surfaced by the runners.
///
/// Phase failures are recorded in the Echo and reported through the cascade
/// result (`status = failed`); they do not escape `CascadeRunner::run` as
/// errors. Config and internal errors do.
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("Phase {phase} failed ({error_type}): {message}")]
    PhaseFailed {
        phase: String,
        error_type: String,
        message: String,
    },

    #[error(transparent)]
    Config(#[from] crate::cascade::ConfigError),

    #[error("Runner error: {0}")]
    Internal(String),
}
