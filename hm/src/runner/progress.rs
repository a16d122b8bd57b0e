//! Live phase progress, published into session state for observers

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;

use crate::echo::Echo;

/// State key observers read progress from
pub const PROGRESS_STATE_KEY: &str = "_phase_progress";

/// Where the phase currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    PreWard,
    Main,
    PostWard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardProgress {
    pub ward_type: String,
    pub name: String,
    pub index: usize,
    pub total: usize,
}

/// Read-only progress snapshot for live UIs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase_name: String,
    pub stage: ProgressStage,
    pub turn: u32,
    pub max_turns: u32,
    pub attempt: u32,
    pub max_attempts: u32,
    pub sounding_index: Option<u32>,
    pub sounding_factor: Option<u32>,
    /// `executing` while attempts run, `evaluating` during selection
    pub sounding_stage: Option<String>,
    pub reforge_step: Option<u32>,
    pub reforge_total: Option<u32>,
    pub ward: Option<WardProgress>,
    pub current_tool: Option<String>,
    pub elapsed_ms: u64,
}

/// Tracks and publishes progress for one phase execution
pub struct ProgressTracker {
    progress: PhaseProgress,
    started: Instant,
    echo: Echo,
}

impl ProgressTracker {
    pub fn new(echo: Echo, phase_name: &str, max_turns: u32, max_attempts: u32) -> Self {
        let progress = PhaseProgress {
            phase_name: phase_name.to_string(),
            stage: ProgressStage::PreWard,
            turn: 0,
            max_turns,
            attempt: 1,
            max_attempts,
            sounding_index: None,
            sounding_factor: None,
            sounding_stage: None,
            reforge_step: None,
            reforge_total: None,
            ward: None,
            current_tool: None,
            elapsed_ms: 0,
        };
        Self {
            progress,
            started: Instant::now(),
            echo,
        }
    }

    pub fn stage(&mut self, stage: ProgressStage) {
        self.progress.stage = stage;
        self.progress.ward = None;
        self.publish();
    }

    pub fn attempt(&mut self, attempt: u32) {
        self.progress.attempt = attempt;
        self.progress.turn = 0;
        self.publish();
    }

    pub fn turn(&mut self, turn: u32) {
        self.progress.turn = turn;
        self.progress.current_tool = None;
        self.publish();
    }

    pub fn ward(&mut self, ward_type: &str, name: &str, index: usize, total: usize) {
        self.progress.ward = Some(WardProgress {
            ward_type: ward_type.to_string(),
            name: name.to_string(),
            index,
            total,
        });
        self.publish();
    }

    pub fn tool(&mut self, name: &str) {
        self.progress.current_tool = Some(name.to_string());
        self.publish();
    }

    pub fn soundings(&mut self, factor: u32, stage: &str) {
        self.progress.sounding_factor = Some(factor);
        self.progress.sounding_stage = Some(stage.to_string());
        self.publish();
    }

    pub fn reforge(&mut self, step: u32, total: u32) {
        self.progress.reforge_step = Some(step);
        self.progress.reforge_total = Some(total);
        self.publish();
    }

    fn publish(&mut self) {
        self.progress.elapsed_ms = self.started.elapsed().as_millis() as u64;
        if let Ok(value) = serde_json::to_value(&self.progress) {
            self.echo.update_state(PROGRESS_STATE_KEY, value);
        }
    }

    /// Remove the progress marker when the phase finishes
    pub fn clear(&self) {
        self.echo.update_state(PROGRESS_STATE_KEY, json!(null));
    }
}
