//! Phase runner - the per-phase scheduler state machine
//!
//! A phase moves through pre-wards, its body (turn loop, soundings or
//! reforge), post-wards, then loop_until / output-schema validation, with
//! retry arcs bounded by `rules.max_attempts`:
//!
//! ```text
//! INIT -> PRE_WARDS -> BODY -> POST_WARDS -> SCHEMA_VALIDATION -> DONE
//!          |             |         |               |
//!          |             |         |               +- invalid, attempts left -> BODY
//!          |             |         +- blocking fail -> FAILED
//!          |             +- error -> FAILED
//!          +- blocking fail -> FAILED
//! ```
//!
//! loop_until runs before output_schema; both count against max_attempts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use logstore::NodeType;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cascade::{HANDOFF_PASS, HANDOFF_STOP, PhaseConfig};
use crate::config::Config;
use crate::context::CallerContext;
use crate::echo::{Echo, HistoryOptions};
use crate::events::EventEmitter;
use crate::llm::{ChatRequest, ModelClient, ModelError, ToolDefinition};
use crate::reforge::run_reforge;
use crate::schema;
use crate::soundings::{
    AttemptBody, AttemptResult, AttemptSpec, Mutation, SoundingsEngine, SoundingsRun, apply_mutation,
};
use crate::tools::{ToolContext, ToolDispatcher, ToolError, select_tackle};
use crate::wards::{WardEngine, WardStage, WardVerdict};

use super::progress::{ProgressStage, ProgressTracker};
use super::template::{TemplateContext, render_instructions};
use super::CascadeError;

/// Shared services a phase executes against
#[derive(Clone)]
pub struct PhaseServices {
    pub echo: Echo,
    pub client: Arc<dyn ModelClient>,
    pub wards: Arc<WardEngine>,
    pub soundings: Arc<SoundingsEngine>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub runtime: Arc<Config>,
    pub emitter: EventEmitter,
    pub caller: CallerContext,
}

/// Where execution goes after this phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffDecision {
    /// Fall through to the next declared phase
    NextDeclared,
    /// Jump to a named phase
    Jump(String),
    /// Terminate the cascade
    Stop,
}

/// A successfully completed phase
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub output: Value,
    /// What lineage records; differs from `output` on dynamic routing
    pub lineage_output: Value,
    pub handoff: HandoffDecision,
    pub trace_id: String,
}

struct BodyResult {
    output: Value,
    cost: f64,
    tokens: i64,
    duration_ms: i64,
}

/// Drive one phase to completion.
///
/// On success the output is persisted (`state[phase] = output`, lineage
/// appended). On failure the error is recorded in the Echo and returned.
pub async fn run_phase(
    services: &PhaseServices,
    phase: Arc<PhaseConfig>,
    inputs: Value,
    cascade_trace: &str,
    depth: i64,
) -> Result<PhaseOutcome, CascadeError> {
    let name = phase.name.clone();
    info!(phase = %name, "run_phase: starting");
    let echo = services.echo.clone();
    echo.set_phase_context(Some(name.clone()));

    let phase_trace = echo.add_history(
        &json!({"role": "system", "content": format!("Phase: {name}")}),
        HistoryOptions::node(NodeType::Phase)
            .with_parent(cascade_trace)
            .with_depth(depth)
            .with_meta("phase_name", json!(name)),
    );
    services.emitter.phase_start(&name);

    let mut tracker = ProgressTracker::new(echo.clone(), &name, phase.rules.max_turns, phase.rules.max_attempts);

    // Tackle resolution happens once per phase; manifest mode asks the
    // quartermaster
    let tool_names = match resolve_tackle(services, &phase, &phase_trace, depth).await {
        Ok(names) => names,
        Err(e) => {
            return Err(fail_phase(services, &mut tracker, &name, "error", &e.to_string(), &phase_trace));
        }
    };
    let tools = services.dispatcher.registry().definitions_for(&tool_names);

    let attempts = drive_attempts(services, &phase, &inputs, &phase_trace, depth, &mut tracker, tools);
    let result = match phase.rules.timeout_ms {
        Some(timeout_ms) => match tokio::time::timeout(Duration::from_millis(timeout_ms), attempts).await {
            Ok(result) => result,
            Err(_) => Err(("timeout".to_string(), format!("phase deadline of {timeout_ms}ms exceeded"))),
        },
        None => attempts.await,
    };

    let body = match result {
        Ok(body) => body,
        Err((error_type, message)) => {
            return Err(fail_phase(services, &mut tracker, &name, &error_type, &message, &phase_trace));
        }
    };

    // Output persistence
    echo.update_state(name.clone(), body.output.clone());

    let (handoff, lineage_output) = decide_handoff(services, &phase, &body.output, &phase_trace, depth).await;
    echo.add_lineage(name.clone(), lineage_output.clone(), Some(phase_trace.clone()));

    services.emitter.phase_complete(&name, &preview_text(&body.output));
    tracker.clear();
    info!(phase = %name, "run_phase: complete");

    Ok(PhaseOutcome {
        output: body.output,
        lineage_output,
        handoff,
        trace_id: phase_trace,
    })
}

fn fail_phase(
    services: &PhaseServices,
    tracker: &mut ProgressTracker,
    phase_name: &str,
    error_type: &str,
    message: &str,
    phase_trace: &str,
) -> CascadeError {
    warn!(phase = %phase_name, %error_type, %message, "phase failed");
    services
        .echo
        .add_error(phase_name, error_type, message, json!({}));
    services.echo.add_history(
        &json!({"role": "system", "content": format!("{error_type}: {message}")}),
        HistoryOptions::node(NodeType::Error)
            .with_parent(phase_trace)
            .with_meta("phase_name", json!(phase_name))
            .with_meta("error_type", json!(error_type)),
    );
    tracker.clear();
    CascadeError::PhaseFailed {
        phase: phase_name.to_string(),
        error_type: error_type.to_string(),
        message: message.to_string(),
    }
}

/// The attempt loop: pre-wards, body, post-wards, validation.
/// Errors are `(error_type, message)` pairs for the failure record.
async fn drive_attempts(
    services: &PhaseServices,
    phase: &Arc<PhaseConfig>,
    inputs: &Value,
    phase_trace: &str,
    depth: i64,
    tracker: &mut ProgressTracker,
    tools: Vec<ToolDefinition>,
) -> Result<BodyResult, (String, String)> {
    let name = &phase.name;
    let max_attempts = phase.rules.max_attempts.max(1);
    let mut last_failure: Option<(String, String)> = None;

    for attempt in 1..=max_attempts {
        debug!(phase = %name, attempt, max_attempts, "drive_attempts: attempt starting");
        tracker.attempt(attempt);

        // PRE_WARDS
        tracker.stage(ProgressStage::PreWard);
        match services
            .wards
            .run_stage(WardStage::Pre, &phase.wards.pre, inputs, name, &services.echo, Some(phase_trace))
            .await
        {
            WardVerdict::Block(record) => {
                return Err((
                    "ward_block".to_string(),
                    format!(
                        "pre-ward '{}' failed: {}",
                        record.name,
                        record.reason.unwrap_or_default()
                    ),
                ));
            }
            WardVerdict::Retry(record) => {
                last_failure = Some((
                    "validation_error".to_string(),
                    format!(
                        "pre-ward '{}' failed: {}",
                        record.name,
                        record.reason.unwrap_or_default()
                    ),
                ));
                continue;
            }
            WardVerdict::Pass => {}
        }

        // BODY
        tracker.stage(ProgressStage::Main);
        let body = match execute_body(services, phase, inputs, phase_trace, depth, attempt, tracker, &tools).await {
            Ok(body) => body,
            Err(e) => {
                let error_type = e
                    .downcast_ref::<ModelError>()
                    .map(|me| me.error_type())
                    .unwrap_or("error");
                return Err((error_type.to_string(), e.to_string()));
            }
        };
        let BodyResult {
            output: body_output,
            cost,
            tokens,
            duration_ms,
        } = body;
        let mut output = body_output;

        // POST_WARDS
        tracker.stage(ProgressStage::PostWard);
        match services
            .wards
            .run_stage(WardStage::Post, &phase.wards.post, &output, name, &services.echo, Some(phase_trace))
            .await
        {
            WardVerdict::Block(record) => {
                return Err((
                    "ward_block".to_string(),
                    format!(
                        "post-ward '{}' failed: {}",
                        record.name,
                        record.reason.unwrap_or_default()
                    ),
                ));
            }
            WardVerdict::Retry(record) => {
                last_failure = Some((
                    "validation_error".to_string(),
                    format!(
                        "post-ward '{}' failed: {}",
                        record.name,
                        record.reason.unwrap_or_default()
                    ),
                ));
                continue;
            }
            WardVerdict::Pass => {}
        }

        // SCHEMA_VALIDATION: loop_until first, then output_schema
        if let Some(loop_until) = &phase.rules.loop_until {
            let outcome = services.wards.evaluate(loop_until, None, &output).await;
            log_validation(services, name, phase_trace, "loop_until", outcome.valid, outcome.reason.as_deref());
            if !outcome.valid {
                last_failure = Some((
                    "validation_error".to_string(),
                    format!("loop_until '{loop_until}' not satisfied: {}", outcome.reason.unwrap_or_default()),
                ));
                log_validation_retry(services, name, phase_trace, attempt, max_attempts);
                continue;
            }
        }

        if let Some(output_schema) = &phase.output_schema {
            match schema::validate_output(&output, output_schema) {
                Ok(parsed) => {
                    log_validation(services, name, phase_trace, "output_schema", true, None);
                    output = parsed;
                }
                Err(errors) => {
                    let reason = errors.join("; ");
                    log_validation(services, name, phase_trace, "output_schema", false, Some(&reason));
                    last_failure = Some(("schema_validation_failed".to_string(), reason));
                    log_validation_retry(services, name, phase_trace, attempt, max_attempts);
                    continue;
                }
            }
        }

        return Ok(BodyResult {
            output,
            cost,
            tokens,
            duration_ms,
        });
    }

    Err(last_failure.unwrap_or_else(|| ("error".to_string(), "attempts exhausted with no recorded failure".to_string())))
}

fn log_validation(
    services: &PhaseServices,
    phase_name: &str,
    phase_trace: &str,
    check: &str,
    valid: bool,
    reason: Option<&str>,
) {
    let node_type = if valid { NodeType::Validation } else { NodeType::SchemaValidation };
    services.echo.add_history(
        &json!({
            "role": "system",
            "content": {"check": check, "valid": valid, "reason": reason},
        }),
        HistoryOptions::node(node_type)
            .with_parent(phase_trace)
            .with_meta("phase_name", json!(phase_name))
            .with_meta("valid", json!(valid)),
    );
}

fn log_validation_retry(
    services: &PhaseServices,
    phase_name: &str,
    phase_trace: &str,
    attempt: u32,
    max_attempts: u32,
) {
    if attempt >= max_attempts {
        return;
    }
    services.echo.add_history(
        &json!({
            "role": "system",
            "content": format!("Validation failed on attempt {attempt}/{max_attempts}; re-running body"),
        }),
        HistoryOptions::node(NodeType::ValidationRetry)
            .with_parent(phase_trace)
            .with_meta("phase_name", json!(phase_name))
            .with_meta("attempt_number", json!(attempt)),
    );
}

async fn resolve_tackle(
    services: &PhaseServices,
    phase: &PhaseConfig,
    phase_trace: &str,
    _depth: i64,
) -> eyre::Result<Vec<String>> {
    let Some(tackle) = &phase.tackle else {
        return Ok(Vec::new());
    };

    if !tackle.is_manifest() {
        return Ok(tackle.tool_names());
    }

    let selection = select_tackle(
        services.client.as_ref(),
        &services.runtime.provider.quartermaster_model,
        &phase.instructions,
        services.dispatcher.registry(),
    )
    .await?;

    services.echo.add_history(
        &json!({
            "role": "system",
            "content": {
                "selected_tackle": selection.selected_tackle,
                "reasoning": selection.reasoning,
            },
        }),
        HistoryOptions::node(NodeType::QuartermasterResult)
            .with_parent(phase_trace)
            .with_meta("phase_name", json!(phase.name))
            .with_meta("semantic_actor", json!("quartermaster")),
    );
    Ok(selection.selected_tackle)
}

#[allow(clippy::too_many_arguments)]
async fn execute_body(
    services: &PhaseServices,
    phase: &Arc<PhaseConfig>,
    inputs: &Value,
    phase_trace: &str,
    depth: i64,
    attempt: u32,
    tracker: &mut ProgressTracker,
    tools: &[ToolDefinition],
) -> eyre::Result<BodyResult> {
    let exec = TurnExec {
        echo: services.echo.clone(),
        client: services.client.clone(),
        wards: services.wards.clone(),
        dispatcher: services.dispatcher.clone(),
        emitter: services.emitter.clone(),
        caller: services.caller.for_task(),
        phase: phase.clone(),
        model_spec: phase
            .model
            .clone()
            .unwrap_or_else(|| services.runtime.provider.default_model.clone()),
        tools: tools.to_vec(),
        inputs: inputs.clone(),
        parent_trace: phase_trace.to_string(),
        depth: depth + 1,
        attempt,
    };

    match &phase.soundings {
        None => execute_turns(exec, None).await,
        Some(soundings_config) => {
            tracker.soundings(soundings_config.factor, "executing");
            let adapter = TurnBodyAdapter { exec };

            let run = SoundingsRun {
                config: crate::cascade::SoundingsConfig {
                    reforge: None,
                    ..soundings_config.clone()
                },
                phase_name: phase.name.clone(),
                echo: services.echo.clone(),
                parent_trace: Some(phase_trace.to_string()),
                reforge_step: None,
                refine_base: None,
            };
            let outcome = services.soundings.run(&run, &adapter).await?;
            tracker.soundings(soundings_config.factor, "evaluating");

            let mut winner = outcome.winner;
            if let Some(reforge_config) = &soundings_config.reforge {
                tracker.reforge(0, reforge_config.steps);
                winner = run_reforge(
                    &services.soundings,
                    reforge_config,
                    &phase.name,
                    &services.echo,
                    Some(phase_trace.to_string()),
                    winner,
                    &adapter,
                )
                .await?;
                tracker.reforge(reforge_config.steps, reforge_config.steps);
            }

            Ok(BodyResult {
                output: winner.output,
                cost: winner.cost,
                tokens: winner.tokens,
                duration_ms: winner.duration_ms,
            })
        }
    }
}

/// Everything one turn-loop execution needs, clonable into `'static`
/// futures for sounding attempts
#[derive(Clone)]
struct TurnExec {
    echo: Echo,
    client: Arc<dyn ModelClient>,
    wards: Arc<WardEngine>,
    dispatcher: Arc<ToolDispatcher>,
    emitter: EventEmitter,
    caller: CallerContext,
    phase: Arc<PhaseConfig>,
    model_spec: String,
    tools: Vec<ToolDefinition>,
    inputs: Value,
    parent_trace: String,
    depth: i64,
    attempt: u32,
}

/// Adapter running the turn loop as a sounding attempt body
struct TurnBodyAdapter {
    exec: TurnExec,
}

impl AttemptBody for TurnBodyAdapter {
    fn launch(&self, spec: AttemptSpec) -> BoxFuture<'static, eyre::Result<AttemptResult>> {
        let exec = self.exec.clone();
        Box::pin(async move {
            let started = Instant::now();
            let body = execute_turns(exec, spec.mutation.clone()).await?;
            Ok(AttemptResult {
                output: body.output,
                cost: body.cost,
                tokens: body.tokens,
                duration_ms: started.elapsed().as_millis() as i64,
                trace_id: None,
            })
        })
    }
}

/// The turn loop: render, call the model, dispatch tools, check loop_until.
async fn execute_turns(exec: TurnExec, mutation: Option<Mutation>) -> eyre::Result<BodyResult> {
    let started = Instant::now();
    let phase = &exec.phase;
    let max_turns = phase.rules.max_turns.max(1);
    debug!(phase = %phase.name, max_turns, "execute_turns");

    let mut history: Vec<Value> = Vec::new();
    let mut output = Value::Null;
    let mut total_cost = 0.0;
    let mut total_tokens = 0i64;
    let mut pending_tool_results = false;

    let mut turn = 0u32;
    while turn < max_turns {
        turn += 1;
        exec.emitter.turn_start(&phase.name, turn);

        let turn_trace = exec.echo.add_history(
            &json!({"role": "system", "content": format!("Turn {turn}")}),
            HistoryOptions::node(NodeType::Turn)
                .with_parent(exec.parent_trace.clone())
                .with_depth(exec.depth)
                .with_meta("turn_number", json!(turn))
                .with_meta("attempt_number", json!(exec.attempt)),
        );

        // A fresh prompt opens the conversation and re-engages after
        // plain-text turns; tool results speak for themselves
        if !pending_tool_results {
            let template_ctx = TemplateContext {
                input: exec.inputs.clone(),
                state: exec.echo.state_snapshot(),
                lineage: exec.echo.lineage(),
                phase_name: phase.name.clone(),
                turn,
                attempt: exec.attempt,
            };
            let mut prompt = render_instructions(&phase.instructions, &template_ctx)?;
            if turn == 1 {
                if let Some(mutation) = &mutation {
                    prompt = apply_mutation(&prompt, mutation);
                }
            }

            let species_hash = format!("{:x}", Sha256::digest(prompt.as_bytes()));
            let user_entry = json!({"role": "user", "content": prompt});
            exec.echo.add_history(
                &user_entry,
                HistoryOptions::node(NodeType::TurnInput)
                    .with_parent(turn_trace.clone())
                    .with_depth(exec.depth + 1)
                    .with_meta("turn_number", json!(turn))
                    .with_meta("attempt_number", json!(exec.attempt))
                    .with_meta("species_hash", json!(species_hash)),
            );
            history.push(user_entry);
        }
        pending_tool_results = false;

        let request = ChatRequest {
            model_spec: exec.model_spec.clone(),
            system: String::new(),
            history: history.clone(),
            user: None,
            tools: exec.tools.clone(),
            use_native_tools: phase.use_native_tools,
            modalities: None,
            session_id: Some(exec.echo.session_id().to_string()),
            trace_id: Some(exec.parent_trace.clone()),
            caller_id: exec.caller.caller_id.clone(),
        };
        let model_turn = exec.client.run(request).await.map_err(eyre::Report::new)?;

        total_cost += model_turn.cost.unwrap_or(0.0);
        total_tokens += model_turn.tokens_out;

        let assistant_entry = model_turn.to_history_entry();
        let mut agent_opts = HistoryOptions::node(NodeType::Agent)
            .with_parent(turn_trace.clone())
            .with_depth(exec.depth + 1)
            .with_meta("turn_number", json!(turn))
            .with_meta("attempt_number", json!(exec.attempt))
            .with_meta("model", json!(model_turn.model))
            .with_meta("provider", json!(model_turn.provider))
            .with_meta("tokens_in", json!(model_turn.tokens_in))
            .with_meta("tokens_out", json!(model_turn.tokens_out))
            .with_meta("duration_ms", json!(model_turn.duration_ms))
            .with_meta("semantic_actor", json!("main_agent"));
        if let Some(request_id) = &model_turn.id {
            agent_opts = agent_opts.with_meta("request_id", json!(request_id));
        }
        if let Some(cost) = model_turn.cost {
            agent_opts = agent_opts.with_meta("cost", json!(cost));
        }
        if let Some(reasoning) = model_turn.tokens_reasoning {
            agent_opts = agent_opts.with_meta("tokens_reasoning", json!(reasoning));
        }
        exec.echo.add_history(&assistant_entry, agent_opts);
        history.push(assistant_entry);

        // Native mode reads the structured tool_calls; prompt mode parses
        // fenced blocks out of the text
        let calls: Vec<(String, String, Value)> = if phase.use_native_tools {
            model_turn
                .tool_calls
                .iter()
                .map(|call| (call.id.clone(), call.function.name.clone(), call.args_value()))
                .collect()
        } else {
            parse_prompt_tool_calls(&model_turn.content)
                .into_iter()
                .enumerate()
                .map(|(i, (name, args))| (format!("prompt_call_{turn}_{i}"), name, args))
                .collect()
        };

        exec.emitter.turn_complete(&phase.name, turn, !calls.is_empty());

        if !calls.is_empty() {
            for (call_id, tool_name, args) in calls {
                dispatch_one(&exec, &mut history, turn, &turn_trace, &call_id, &tool_name, args).await?;
            }
            pending_tool_results = true;
            continue;
        }

        output = json!(model_turn.content);

        // loop_until exits early when satisfied; without one, a plain text
        // answer ends the body
        match &phase.rules.loop_until {
            Some(loop_until) => {
                if exec.wards.evaluate(loop_until, None, &output).await.valid {
                    break;
                }
            }
            None => break,
        }
    }

    Ok(BodyResult {
        output,
        cost: total_cost,
        tokens: total_tokens,
        duration_ms: started.elapsed().as_millis() as i64,
    })
}

async fn dispatch_one(
    exec: &TurnExec,
    history: &mut Vec<Value>,
    turn: u32,
    turn_trace: &str,
    call_id: &str,
    tool_name: &str,
    args: Value,
) -> eyre::Result<()> {
    let args_preview = args.to_string();
    exec.emitter.tool_call(&exec.phase.name, tool_name, &args_preview);
    exec.echo.add_history(
        &json!({"role": "assistant", "content": {"tool": tool_name, "args": args.clone()}}),
        HistoryOptions::node(NodeType::ToolCall)
            .with_parent(turn_trace)
            .with_depth(exec.depth + 2)
            .with_meta("turn_number", json!(turn))
            .with_meta("tool_name", json!(tool_name)),
    );

    let tool_ctx = ToolContext::new(exec.echo.session_id())
        .with_phase(exec.phase.name.clone())
        .with_caller(exec.caller.for_task());

    let tool_started = Instant::now();
    let result = match exec.dispatcher.invoke(tool_name, args, &tool_ctx).await {
        Ok(output) => output,
        Err(e @ ToolError::Critical { .. }) => return Err(eyre::Report::new(e)),
        Err(e) => crate::tools::ToolOutput::error(e),
    };
    let duration_ms = tool_started.elapsed().as_millis() as u64;

    exec.emitter.tool_complete(
        &exec.phase.name,
        tool_name,
        !result.is_error,
        &result.content_text(),
        duration_ms,
    );

    let mut result_opts = HistoryOptions::node(NodeType::ToolResult)
        .with_parent(turn_trace)
        .with_depth(exec.depth + 2)
        .with_meta("turn_number", json!(turn))
        .with_meta("tool_name", json!(tool_name))
        .with_meta("duration_ms", json!(duration_ms))
        .with_meta("semantic_purpose", json!("tool_response"));
    if result.is_error {
        result_opts = result_opts.with_meta("error", json!(true));
    }
    exec.echo.add_history(&json!({"role": "tool", "content": result.to_value()}), result_opts);

    if exec.phase.use_native_tools {
        history.push(json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": result.content_text(),
        }));
    } else {
        history.push(json!({
            "role": "user",
            "content": format!("Tool {tool_name} returned: {}", result.content_text()),
        }));
    }
    Ok(())
}

/// Parse in-prompt tool invocations from fenced blocks:
///
/// ````text
/// ```tool
/// {"name": "set_state", "args": {"key": "k", "value": "v"}}
/// ```
/// ````
pub fn parse_prompt_tool_calls(content: &str) -> Vec<(String, Value)> {
    let mut calls = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("```tool") {
        let after = &rest[start + "```tool".len()..];
        let Some(end) = after.find("```") else { break };
        let block = after[..end].trim();
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            if let Some(name) = value["name"].as_str() {
                let args = value.get("args").cloned().unwrap_or_else(|| json!({}));
                calls.push((name.to_string(), args));
            }
        }
        rest = &after[end + 3..];
    }
    calls
}

/// Resolve where execution goes next. Multiple declared targets make the
/// model choose; the decision is logged so visualisation can tell the taken
/// path from the available ones.
async fn decide_handoff(
    services: &PhaseServices,
    phase: &PhaseConfig,
    output: &Value,
    phase_trace: &str,
    _depth: i64,
) -> (HandoffDecision, Value) {
    let Some(handoffs) = &phase.handoffs else {
        return (HandoffDecision::NextDeclared, output.clone());
    };
    if handoffs.is_empty() {
        return (HandoffDecision::NextDeclared, output.clone());
    }

    if handoffs.len() == 1 {
        return (resolve_target(handoffs[0].target()), output.clone());
    }

    // Dynamic routing: the model chooses among the declared targets
    let targets: Vec<&str> = handoffs.iter().map(|h| h.target()).collect();
    let chosen = choose_route(services, phase, output, &targets).await;

    let note = format!("Dynamically routed to: {chosen}");
    services.echo.add_history(
        &json!({"role": "system", "content": note}),
        HistoryOptions::node(NodeType::Routing)
            .with_parent(phase_trace)
            .with_meta("phase_name", json!(phase.name))
            .with_meta("route_taken", json!(chosen))
            .with_meta("routes_available", json!(targets)),
    );

    (resolve_target(&chosen), json!(note))
}

fn resolve_target(target: &str) -> HandoffDecision {
    match target {
        HANDOFF_STOP => HandoffDecision::Stop,
        HANDOFF_PASS => HandoffDecision::NextDeclared,
        name => HandoffDecision::Jump(name.to_string()),
    }
}

async fn choose_route(services: &PhaseServices, phase: &PhaseConfig, output: &Value, targets: &[&str]) -> String {
    let model = phase
        .model
        .clone()
        .unwrap_or_else(|| services.runtime.provider.default_model.clone());
    let system = "You are routing a workflow. Given the phase output and the available \
                  next phases, answer with EXACTLY one phase name from the list, nothing else.";
    let user = format!(
        "## Phase output\n{}\n\n## Available next phases\n{}",
        preview_text(output),
        targets.join("\n")
    );

    match services.client.run(ChatRequest::new(model.as_str(), system).with_user(user)).await {
        Ok(turn) => {
            let answer = turn.content.trim();
            // Exact match first, then containment
            targets
                .iter()
                .find(|t| answer.eq_ignore_ascii_case(t))
                .or_else(|| targets.iter().find(|t| answer.contains(*t)))
                .map(|t| t.to_string())
                .unwrap_or_else(|| {
                    warn!(%answer, "choose_route: unrecognised answer, taking first target");
                    targets[0].to_string()
                })
        }
        Err(e) => {
            warn!(error = %e, "choose_route: routing call failed, taking first target");
            targets[0].to_string()
        }
    }
}

fn preview_text(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    crate::events::preview(&text, 500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_prompt_tool_calls() {
        let content = "I'll persist that.\n```tool\n{\"name\": \"set_state\", \"args\": {\"key\": \"k\", \"value\": 1}}\n```\nDone.";
        let calls = parse_prompt_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "set_state");
        assert_eq!(calls[0].1, json!({"key": "k", "value": 1}));
    }

    #[test]
    fn test_parse_prompt_tool_calls_multiple_and_garbage() {
        let content = "```tool\n{\"name\": \"a\"}\n```\ntext\n```tool\nnot json\n```\n```tool\n{\"name\": \"b\", \"args\": {\"x\": 2}}\n```";
        let calls = parse_prompt_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "a");
        assert_eq!(calls[0].1, json!({}));
        assert_eq!(calls[1].1, json!({"x": 2}));
    }

    #[test]
    fn test_parse_prompt_tool_calls_none() {
        assert!(parse_prompt_tool_calls("no tools here").is_empty());
    }

    #[test]
    fn test_resolve_target_sentinels() {
        assert_eq!(resolve_target("STOP"), HandoffDecision::Stop);
        assert_eq!(resolve_target("PASS"), HandoffDecision::NextDeclared);
        assert_eq!(resolve_target("review"), HandoffDecision::Jump("review".to_string()));
    }
}
