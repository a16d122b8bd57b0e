//! Cascade runner - the top-level orchestrator
//!
//! Resolves a config, acquires the session Echo, walks phases per their
//! handoffs, spawns sub-cascades on child sessions, and assembles the final
//! structured result. Phase failures land in `errors` and flip the result
//! status to `failed`; only config errors and engine bugs surface as `Err`.

use std::sync::Arc;

use async_trait::async_trait;
use logstore::NodeType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cascade::{
    CascadeConfig, ConfigSource, SoundingsConfig, SubCascadeSpec, apply_overrides, load_config,
};
use crate::config::Config;
use crate::context::CallerContext;
use crate::echo::{Echo, EchoSnapshot, HistoryOptions, LineageEntry, get_echo, lookup_session};
use crate::events::EventBus;
use crate::llm::ModelClient;
use crate::logsink::LogSink;
use crate::narrator::{NarrationBackend, NarratorService, internal_narrator_config};
use crate::soundings::{Candidate, SoundingsEngine, select_winner};
use crate::tools::{CascadeInvoker, CascadeToolSpec, ToolContext, ToolDispatcher};
use crate::wards::WardEngine;

use super::phase::{HandoffDecision, PhaseServices, run_phase};
use super::CascadeError;

/// Guard against unbounded handoff cycles
const MAX_PHASE_EXECUTIONS: usize = 10_000;

/// The structured result every invocation receives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeResult {
    pub session_id: String,
    pub state: Map<String, Value>,
    pub history: Vec<Value>,
    pub lineage: Vec<LineageEntry>,
    pub errors: Vec<crate::echo::ErrorEntry>,
    pub has_errors: bool,
    pub status: String,
    pub result: Option<Value>,
}

impl CascadeResult {
    fn from_snapshot(snapshot: EchoSnapshot) -> Self {
        let result = snapshot.lineage.last().map(|entry| entry.output.clone());
        Self {
            session_id: snapshot.session_id,
            state: snapshot.state,
            history: snapshot.history,
            lineage: snapshot.lineage,
            errors: snapshot.errors,
            has_errors: snapshot.has_errors,
            status: snapshot.status,
            result,
        }
    }
}

/// Per-invocation options
#[derive(Clone, Default)]
pub struct RunOptions {
    pub session_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub caller: CallerContext,
    /// Caller-supplied cascade overrides (legacy flat or structured form)
    pub overrides: Option<Value>,
    /// Nesting depth; sub-cascades run at depth + 1
    pub depth: u32,
}

struct RunnerCore {
    runtime: Arc<Config>,
    client: Arc<dyn ModelClient>,
    wards: Arc<WardEngine>,
    soundings: Arc<SoundingsEngine>,
    dispatcher: Arc<ToolDispatcher>,
    bus: Arc<EventBus>,
    sink: Option<LogSink>,
}

/// The top-level orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct CascadeRunner {
    core: Arc<RunnerCore>,
}

impl CascadeRunner {
    pub fn new(
        runtime: Arc<Config>,
        client: Arc<dyn ModelClient>,
        dispatcher: Arc<ToolDispatcher>,
        bus: Arc<EventBus>,
        sink: Option<LogSink>,
    ) -> Self {
        let wards = Arc::new(WardEngine::new(client.clone(), runtime.provider.evaluator_model.clone()));
        let soundings = Arc::new(SoundingsEngine::new(
            client.clone(),
            runtime.provider.evaluator_model.clone(),
            runtime.takes.max_parallel,
        ));
        let runner = Self {
            core: Arc::new(RunnerCore {
                runtime,
                client,
                wards,
                soundings,
                dispatcher: dispatcher.clone(),
                bus,
                sink,
            }),
        };
        // Cascade-as-tool dispatch loops back into this runner
        dispatcher.set_invoker(Arc::new(runner.clone()));
        runner
    }

    /// Run a cascade to completion.
    pub async fn run(&self, source: ConfigSource, inputs: Value, opts: RunOptions) -> eyre::Result<CascadeResult> {
        let mut config = load_config(&source)?;
        if let Some(overrides) = &opts.overrides {
            config = apply_overrides(config, overrides)?;
        }
        let cascade_file = match &source {
            ConfigSource::Path(path) => Some(path.display().to_string()),
            ConfigSource::Inline(_) => None,
        };

        // Cascade-level soundings: run the whole cascade N times, pick a
        // winner. Inner runs drop the takes block.
        if let Some(takes) = config.takes.clone() {
            let mut inner = config.clone();
            inner.takes = None;
            return self.run_cascade_soundings(inner, takes, inputs, opts).await;
        }

        self.run_once(config, cascade_file, inputs, opts).await
    }

    async fn run_once(
        &self,
        config: CascadeConfig,
        cascade_file: Option<String>,
        inputs: Value,
        opts: RunOptions,
    ) -> eyre::Result<CascadeResult> {
        let core = &self.core;
        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        info!(cascade_id = %config.cascade_id, %session_id, "cascade starting");

        let echo = get_echo(&session_id, opts.parent_session_id.as_deref());
        if let Some(sink) = &core.sink {
            echo.set_sink(sink.clone());
        }
        echo.set_caller(opts.caller.for_task());
        echo.set_cascade_context(Some(config.cascade_id.clone()));

        let mut cascade_meta = HistoryOptions::node(NodeType::Cascade)
            .with_meta("cascade_id", json!(config.cascade_id))
            .with_meta("depth", json!(opts.depth));
        if let Some(file) = &cascade_file {
            cascade_meta = cascade_meta.with_meta("cascade_file", json!(file));
        }
        let cascade_trace = echo.add_history(
            &json!({"role": "system", "content": format!("Cascade: {}", config.cascade_id)}),
            cascade_meta,
        );

        let emitter = core.bus.emitter_for(&session_id);
        emitter.cascade_start(&config.cascade_id, opts.depth, opts.parent_session_id.as_deref());

        // Narrator rides along on its own thread of control
        let narrator = config.narrator.clone().map(|narrator_config| {
            let backend = Arc::new(RunnerNarrationBackend {
                runner: self.clone(),
                session_id: session_id.clone(),
                model: narrator_config
                    .model
                    .clone()
                    .unwrap_or_else(|| core.runtime.provider.default_model.clone()),
                instructions: narrator_config.instructions.clone(),
            });
            NarratorService::start(narrator_config, session_id.clone(), config.cascade_id.clone(), &core.bus, backend)
        });

        let services = PhaseServices {
            echo: echo.clone(),
            client: core.client.clone(),
            wards: core.wards.clone(),
            soundings: core.soundings.clone(),
            dispatcher: core.dispatcher.clone(),
            runtime: core.runtime.clone(),
            emitter: emitter.clone(),
            caller: opts.caller.for_task(),
        };

        let config = Arc::new(config);
        let mut index = 0usize;
        let mut executed = 0usize;
        let mut failed = false;

        while index < config.phases.len() {
            executed += 1;
            if executed > MAX_PHASE_EXECUTIONS {
                return Err(CascadeError::Internal(format!(
                    "handoff loop guard tripped after {MAX_PHASE_EXECUTIONS} phase executions"
                ))
                .into());
            }

            let phase = Arc::new(config.phases[index].clone());
            match run_phase(&services, phase.clone(), inputs.clone(), &cascade_trace, 1).await {
                Ok(outcome) => {
                    for sub in &phase.sub_cascades {
                        self.run_sub_cascade(sub, &echo, &opts.caller).await;
                    }
                    match outcome.handoff {
                        HandoffDecision::NextDeclared => index += 1,
                        HandoffDecision::Stop => break,
                        HandoffDecision::Jump(target) => match config.phase_index(&target) {
                            Some(target_index) => index = target_index,
                            None => {
                                echo.add_error(
                                    &phase.name,
                                    "error",
                                    format!("handoff target '{target}' does not exist"),
                                    json!({}),
                                );
                                failed = true;
                                break;
                            }
                        },
                    }
                }
                Err(CascadeError::PhaseFailed { .. }) => {
                    // Recorded in the Echo by the phase runner
                    failed = true;
                    break;
                }
                Err(engine_bug) => return Err(engine_bug.into()),
            }
        }

        echo.set_phase_context(None);
        let snapshot = echo.snapshot();
        let failed = failed || snapshot.has_errors;

        if failed {
            let last_error = snapshot.errors.last();
            echo.add_history(
                &json!({"role": "system", "content": format!("Cascade failed: {}", config.cascade_id)}),
                HistoryOptions::node(NodeType::Lifecycle)
                    .with_parent(cascade_trace.clone())
                    .with_meta("cascade_id", json!(config.cascade_id)),
            );
            emitter.cascade_error(
                &config.cascade_id,
                last_error.map(|e| e.error_message.as_str()).unwrap_or("unknown"),
                last_error.map(|e| e.error_type.as_str()).unwrap_or("error"),
            );
        } else {
            echo.add_history(
                &json!({"role": "system", "content": format!("Cascade complete: {}", config.cascade_id)}),
                HistoryOptions::node(NodeType::Lifecycle)
                    .with_parent(cascade_trace.clone())
                    .with_meta("cascade_id", json!(config.cascade_id)),
            );
            emitter.cascade_complete(&config.cascade_id, "success");
        }

        if let Some(narrator) = narrator {
            narrator.stop().await;
        }

        debug!(cascade_id = %config.cascade_id, %session_id, failed, "cascade finished");
        Ok(CascadeResult::from_snapshot(echo.snapshot()))
    }

    /// Run the whole cascade N times and keep the winner.
    async fn run_cascade_soundings(
        &self,
        inner_config: CascadeConfig,
        takes: SoundingsConfig,
        inputs: Value,
        opts: RunOptions,
    ) -> eyre::Result<CascadeResult> {
        let factor = takes.factor.max(1);
        info!(cascade_id = %inner_config.cascade_id, factor, "cascade-level soundings");

        let parent_session = opts
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let parent_echo = get_echo(&parent_session, opts.parent_session_id.as_deref());
        if let Some(sink) = &self.core.sink {
            parent_echo.set_sink(sink.clone());
        }
        parent_echo.set_caller(opts.caller.for_task());
        parent_echo.set_cascade_context(Some(inner_config.cascade_id.clone()));
        parent_echo.add_history(
            &json!({"role": "system", "content": format!("Cascade soundings: {} x{factor}", inner_config.cascade_id)}),
            HistoryOptions::node(NodeType::Cascade)
                .with_meta("cascade_id", json!(inner_config.cascade_id))
                .with_meta("depth", json!(opts.depth)),
        );
        let emitter = self.core.bus.emitter_for(&parent_session);
        emitter.cascade_start(&inner_config.cascade_id, opts.depth, opts.parent_session_id.as_deref());

        let limit = takes.max_parallel.unwrap_or(self.core.runtime.takes.max_parallel).max(1);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(limit));
        let mut tasks: JoinSet<(u32, String, eyre::Result<CascadeResult>)> = JoinSet::new();

        for attempt_index in 0..factor {
            let runner = self.clone();
            let config = inner_config.clone();
            let inputs = inputs.clone();
            let child_session = uuid::Uuid::now_v7().to_string();
            let child_opts = RunOptions {
                session_id: Some(child_session.clone()),
                parent_session_id: Some(parent_session.clone()),
                caller: opts.caller.for_task(),
                overrides: None,
                depth: opts.depth + 1,
            };
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = runner
                    .run_once(config, None, inputs, child_opts)
                    .await;
                (attempt_index, child_session, result)
            });
        }

        let mut attempts: Vec<Option<(String, eyre::Result<CascadeResult>)>> = (0..factor).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, child_session, result)) => attempts[index as usize] = Some((child_session, result)),
                Err(e) => warn!(error = %e, "cascade sounding task panicked"),
            }
        }

        let mut candidates = Vec::new();
        let mut results: Vec<Option<(String, CascadeResult)>> = Vec::new();
        for (index, slot) in attempts.into_iter().enumerate() {
            match slot {
                Some((child_session, Ok(result))) if result.status == "success" => {
                    let content = result
                        .result
                        .as_ref()
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_default();
                    candidates.push(Candidate {
                        index: index as u32,
                        content,
                        cost: 0.0,
                    });
                    results.push(Some((child_session, result)));
                }
                Some((child_session, Ok(result))) => {
                    debug!(%child_session, "cascade sounding attempt failed");
                    results.push(Some((child_session, result)));
                }
                _ => results.push(None),
            }
        }

        if candidates.is_empty() {
            parent_echo.add_error(
                &inner_config.cascade_id,
                "sounding_error",
                format!("all {factor} cascade sounding attempts failed"),
                json!({}),
            );
            emitter.cascade_error(
                &inner_config.cascade_id,
                "all cascade sounding attempts failed",
                "sounding_error",
            );
            return Ok(CascadeResult::from_snapshot(parent_echo.snapshot()));
        }

        let selection = select_winner(
            &self.core.client,
            &self.core.runtime.provider.evaluator_model,
            takes.evaluator.as_ref(),
            &candidates,
        )
        .await;

        for (index, slot) in results.iter().enumerate() {
            let Some((_, result)) = slot else { continue };
            let is_winner = index as u32 == selection.winner_index;
            parent_echo.add_history(
                &json!({"role": "system", "content": result.result.clone().unwrap_or(Value::Null)}),
                HistoryOptions::node(NodeType::SoundingAttempt)
                    .with_meta("sounding_index", json!(index))
                    .with_meta("is_winner", json!(is_winner))
                    .with_meta("cascade_id", json!(inner_config.cascade_id)),
            );
        }
        parent_echo.add_history(
            &json!({"role": "system", "content": selection.reasoning}),
            HistoryOptions::node(NodeType::Evaluator).with_meta("cascade_id", json!(inner_config.cascade_id)),
        );

        // Fold the winning run into the parent session
        if let Some((winner_session, _)) = results
            .get(selection.winner_index as usize)
            .and_then(|slot| slot.as_ref())
        {
            if let Some(winner_echo) = lookup_session(winner_session) {
                parent_echo.merge(&winner_echo);
            }
        }

        let snapshot = parent_echo.snapshot();
        if snapshot.has_errors {
            emitter.cascade_error(&inner_config.cascade_id, "cascade soundings failed", "sounding_error");
        } else {
            emitter.cascade_complete(&inner_config.cascade_id, "success");
        }
        Ok(CascadeResult::from_snapshot(snapshot))
    }

    /// Spawn a declared sub-cascade on a child session and merge it back.
    /// Registered cascade tools go through the dispatcher; bare paths run
    /// directly. Failures are recorded on the parent, not raised.
    async fn run_sub_cascade(&self, spec: &SubCascadeSpec, parent_echo: &Echo, caller: &CallerContext) {
        debug!(cascade = %spec.cascade, "run_sub_cascade");
        let ctx = ToolContext::new(parent_echo.session_id()).with_caller(caller.for_task());
        let inputs = spec.inputs.clone().unwrap_or_else(|| json!({}));

        let outcome = if self.core.dispatcher.registry().has_tool(&spec.cascade) {
            match self.core.dispatcher.invoke(&spec.cascade, inputs, &ctx).await {
                Ok(output) if output.is_error => Err(eyre::eyre!(output.content_text())),
                Ok(_) => Ok(()),
                Err(e) => Err(eyre::Report::new(e)),
            }
        } else {
            let tool_spec = CascadeToolSpec {
                cascade_id: spec.cascade.clone(),
                description: String::new(),
                source: ConfigSource::Path(std::path::PathBuf::from(&spec.cascade)),
                parameters: json!({}),
            };
            self.invoke_cascade(&tool_spec, inputs, &ctx).await.map(|_| ())
        };

        if let Err(e) = outcome {
            warn!(cascade = %spec.cascade, error = %e, "sub-cascade failed");
            parent_echo.add_error(
                parent_echo.current_phase().unwrap_or_default(),
                "error",
                format!("sub-cascade '{}' failed: {e}", spec.cascade),
                json!({}),
            );
        }
    }
}

#[async_trait]
impl CascadeInvoker for CascadeRunner {
    async fn invoke_cascade(&self, spec: &CascadeToolSpec, inputs: Value, ctx: &ToolContext) -> eyre::Result<Value> {
        debug!(cascade = %spec.cascade_id, parent = %ctx.session_id, "invoke_cascade");
        let result = self
            .run(
                spec.source.clone(),
                inputs,
                RunOptions {
                    session_id: None,
                    parent_session_id: Some(ctx.session_id.clone()),
                    caller: ctx.caller.for_task(),
                    overrides: None,
                    depth: 1,
                },
            )
            .await?;

        // Merge the child Echo into the spawning session
        if let (Some(parent), Some(child)) = (lookup_session(&ctx.session_id), lookup_session(&result.session_id)) {
            parent.merge(&child);
        }

        if result.status != "success" {
            let detail = result
                .errors
                .last()
                .map(|e| e.error_message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(eyre::eyre!("sub-cascade '{}' failed: {detail}", spec.cascade_id));
        }
        Ok(result.result.unwrap_or(Value::Null))
    }
}

/// Narration backend: a mini cascade with the `say` tool on a child session
struct RunnerNarrationBackend {
    runner: CascadeRunner,
    session_id: String,
    model: String,
    instructions: Option<String>,
}

#[async_trait]
impl NarrationBackend for RunnerNarrationBackend {
    async fn narrate(&self, context: Value) -> eyre::Result<String> {
        let config = internal_narrator_config(&self.model, self.instructions.as_deref());
        let result = self
            .runner
            .run(
                ConfigSource::Inline(config),
                context,
                RunOptions {
                    session_id: None,
                    parent_session_id: Some(self.session_id.clone()),
                    caller: CallerContext::default(),
                    overrides: None,
                    depth: 1,
                },
            )
            .await?;

        if result.status != "success" {
            return Err(eyre::eyre!("narration cascade failed"));
        }
        Ok(result
            .result
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default())
    }
}
