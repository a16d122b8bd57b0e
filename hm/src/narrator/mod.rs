//! Narrator - event-driven voice commentary
//!
//! One narrator per session subscribes to a configured subset of events and
//! spawns a mini cascade (with the `say` tool) to speak a short synopsis.
//! Design rules, in order:
//!
//! 1. Single-flight: at most one narration runs per session at any instant.
//! 2. Latest-wins: events arriving mid-narration replace the pending one.
//! 3. Debounce: narrations are spaced by `min_interval_seconds`.
//! 4. Staleness: a pending event older than 3x the interval is discarded.
//!
//! Narration never blocks cascade execution; `stop()` grants in-flight
//! audio up to 30 seconds to finish.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cascade::NarratorConfig;
use crate::events::{Event, EventBus};

/// Grace period for in-flight narration on shutdown
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Narrations kept for prompt continuity
const MAX_NARRATION_HISTORY: usize = 5;

/// Runs the actual narration cascade. Implemented by the cascade runner;
/// stubbed in tests.
#[async_trait::async_trait]
pub trait NarrationBackend: Send + Sync {
    async fn narrate(&self, context: Value) -> eyre::Result<String>;
}

#[derive(Debug, Clone)]
struct PendingNarration {
    event: Event,
    received_at: Instant,
}

#[derive(Debug, Clone)]
struct NarrationEntry {
    event: String,
    text: String,
}

struct NarratorState {
    narrating: bool,
    pending: Option<PendingNarration>,
    last_narration: Option<Instant>,
    history: VecDeque<NarrationEntry>,
}

pub struct NarratorService {
    state: Arc<Mutex<NarratorState>>,
    running: Arc<AtomicBool>,
    event_loop: JoinHandle<()>,
}

impl NarratorService {
    /// Subscribe to the bus and start reacting to events
    pub fn start(
        config: NarratorConfig,
        session_id: String,
        cascade_id: String,
        bus: &EventBus,
        backend: Arc<dyn NarrationBackend>,
    ) -> Self {
        let subscribed: Vec<String> = config
            .effective_on_events()
            .into_iter()
            .map(|name| canonical_event_name(&name))
            .collect();
        info!(%session_id, ?subscribed, "NarratorService::start");

        let min_interval = Duration::from_secs_f64(config.min_interval_seconds.max(0.0));
        let state = Arc::new(Mutex::new(NarratorState {
            narrating: false,
            pending: None,
            last_narration: None,
            history: VecDeque::new(),
        }));
        let running = Arc::new(AtomicBool::new(true));

        let mut rx = bus.subscribe();
        let loop_state = state.clone();
        let loop_running = running.clone();
        let event_loop = tokio::spawn(async move {
            let mut tick = tokio::time::interval(min_interval.max(Duration::from_millis(250)) / 2);
            loop {
                if !loop_running.load(Ordering::Relaxed) {
                    break;
                }
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if event.session_id() != session_id {
                                continue;
                            }
                            if !subscribed.iter().any(|name| name == event.event_type()) {
                                continue;
                            }
                            handle_event(
                                event,
                                &loop_state,
                                min_interval,
                                &backend,
                                &cascade_id,
                            )
                            .await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(missed, "narrator lagged behind the event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tick.tick() => {
                        process_pending(&loop_state, min_interval, &backend, &cascade_id).await;
                    }
                }
            }
            debug!("narrator event loop exited");
        });

        Self {
            state,
            running,
            event_loop,
        }
    }

    /// True while a narration cascade is in flight
    pub async fn is_narrating(&self) -> bool {
        self.state.lock().await.narrating
    }

    /// Stop the service, allowing in-flight narration up to 30 s to finish
    pub async fn stop(self) {
        debug!("NarratorService::stop");
        self.running.store(false, Ordering::Relaxed);

        let deadline = Instant::now() + STOP_GRACE;
        loop {
            if !self.state.lock().await.narrating {
                break;
            }
            if Instant::now() >= deadline {
                warn!("narration still running after grace period, shutting down anyway");
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        self.event_loop.abort();
        let _ = self.event_loop.await;
    }
}

/// Config names accept shorthand; the bus speaks canonical types
fn canonical_event_name(name: &str) -> String {
    match name {
        "turn" => "turn_complete".to_string(),
        "tool_call" => "tool_complete".to_string(),
        other => other.to_string(),
    }
}

async fn handle_event(
    event: Event,
    state: &Arc<Mutex<NarratorState>>,
    min_interval: Duration,
    backend: &Arc<dyn NarrationBackend>,
    cascade_id: &str,
) {
    let mut guard = state.lock().await;

    // Latest-wins while a narration is running
    if guard.narrating {
        debug!(event_type = event.event_type(), "narration in flight; replacing pending");
        guard.pending = Some(PendingNarration {
            event,
            received_at: Instant::now(),
        });
        return;
    }

    // Debounce
    if let Some(last) = guard.last_narration {
        if last.elapsed() < min_interval {
            debug!(event_type = event.event_type(), "debounced; storing as pending");
            guard.pending = Some(PendingNarration {
                event,
                received_at: Instant::now(),
            });
            return;
        }
    }

    spawn_narration(event, &mut guard, state, backend, cascade_id);
}

async fn process_pending(
    state: &Arc<Mutex<NarratorState>>,
    min_interval: Duration,
    backend: &Arc<dyn NarrationBackend>,
    cascade_id: &str,
) {
    let mut guard = state.lock().await;
    if guard.narrating {
        return;
    }
    let Some(pending) = guard.pending.clone() else { return };

    // Stale pending events are silently dropped
    if pending.received_at.elapsed() > min_interval * 3 {
        debug!("discarding stale pending narration");
        guard.pending = None;
        return;
    }

    if let Some(last) = guard.last_narration {
        if last.elapsed() < min_interval {
            return;
        }
    }

    guard.pending = None;
    spawn_narration(pending.event, &mut guard, state, backend, cascade_id);
}

fn spawn_narration(
    event: Event,
    guard: &mut tokio::sync::MutexGuard<'_, NarratorState>,
    state: &Arc<Mutex<NarratorState>>,
    backend: &Arc<dyn NarrationBackend>,
    cascade_id: &str,
) {
    guard.narrating = true;

    let previous: Vec<Value> = guard
        .history
        .iter()
        .map(|entry| json!({"event": entry.event, "text": entry.text}))
        .collect();

    let event_type = event.event_type().to_string();
    let context = json!({
        "phase_name": phase_name_of(&event),
        "event_type": event_type,
        "cascade_complete": matches!(event, Event::CascadeComplete { .. } | Event::CascadeError { .. }),
        "cascade_id": cascade_id,
        "context": serde_json::to_string(&event).unwrap_or_default(),
        "previous_narrations": previous,
    });

    let state = state.clone();
    let backend = backend.clone();
    tokio::spawn(async move {
        let narration = backend.narrate(context).await;
        let mut guard = state.lock().await;
        match narration {
            Ok(text) => {
                guard.history.push_back(NarrationEntry {
                    event: event_type,
                    text,
                });
                while guard.history.len() > MAX_NARRATION_HISTORY {
                    guard.history.pop_front();
                }
            }
            Err(e) => warn!(error = %e, "narration failed"),
        }
        guard.last_narration = Some(Instant::now());
        guard.narrating = false;
    });
}

fn phase_name_of(event: &Event) -> Option<String> {
    match event {
        Event::PhaseStart { phase_name, .. }
        | Event::PhaseComplete { phase_name, .. }
        | Event::TurnStart { phase_name, .. }
        | Event::TurnComplete { phase_name, .. }
        | Event::ToolCall { phase_name, .. }
        | Event::ToolComplete { phase_name, .. } => Some(phase_name.clone()),
        _ => None,
    }
}

/// The internal narration cascade: one phase, the `say` tool, a template
/// over the event context.
pub fn internal_narrator_config(model: &str, instructions: Option<&str>) -> Value {
    let default_instructions = "\
You are a concise narrator providing real-time voice updates during an AI workflow.

Current phase: {{ input.phase_name }}
Event: {{ input.event_type }}
{{#if input.cascade_complete}}The workflow has completed.{{/if}}

Recent activity:
{{ input.context }}

{{#if input.previous_narrations}}
## What you've already said (DO NOT REPEAT):
{{#each input.previous_narrations}}
- [{{ this.event }}] \"{{ this.text }}\"
{{/each}}
Build on what you've said before. Reference earlier points if relevant. Maintain your voice consistently.
{{/if}}

Generate a brief 1-2 sentence spoken synopsis, then call the 'say' tool to speak it aloud.
Use expressive tags sparingly: [excited], [curious], [thoughtful].
Focus on what's NEW or what was just accomplished.
{{#if input.cascade_complete}}This is the final update - give a brief wrap-up of the entire journey.{{/if}}

IMPORTANT: You MUST call the 'say' tool with your synopsis. Do not just output text.";

    json!({
        "cascade_id": "_narrator_internal",
        "description": "Internal narrator cascade - generates and speaks status updates",
        "phases": [{
            "name": "speak",
            "instructions": instructions.unwrap_or(default_instructions),
            "model": model,
            "tackle": ["say"],
            "rules": {"max_turns": 2}
        }]
    })
}
