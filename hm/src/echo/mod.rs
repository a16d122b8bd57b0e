//! Echo - per-session state, history, lineage and errors
//!
//! One Echo exists per session. Phase runners, tools and background services
//! mutate it; every history append is forwarded (enriched) to the log sink.
//! Echoes are cheap to clone: all clones share one locked inner state.
//!
//! The process-wide session registry lives here too, keyed by session id.
//! A child session records its `parent_session_id`; on sub-cascade
//! completion the child Echo is merged back into its parent under a
//! `sub_echo` marker.

mod enrichment;
mod mermaid;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use logstore::{LogRecord, NodeType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::context::CallerContext;
use crate::logsink::LogSink;

pub use enrichment::{detect_base64_in_content, extract_audio_paths, extract_image_paths};
pub use mermaid::state_diagram;

/// One completed phase: name, output, and the trace id of its phase entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEntry {
    pub phase: String,
    pub output: Value,
    pub trace_id: Option<String>,
}

/// One recorded failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub phase: String,
    pub error_type: String,
    pub error_message: String,
    pub metadata: Value,
}

/// Snapshot of a session returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoSnapshot {
    pub session_id: String,
    pub state: Map<String, Value>,
    pub history: Vec<Value>,
    pub lineage: Vec<LineageEntry>,
    pub errors: Vec<ErrorEntry>,
    pub has_errors: bool,
    pub status: String,
}

/// Per-append options for [`Echo::add_history`]
#[derive(Clone)]
pub struct HistoryOptions {
    pub node_type: NodeType,
    pub trace_id: Option<String>,
    pub parent_id: Option<String>,
    pub metadata: Map<String, Value>,
    /// Caller already logged this entry itself (e.g. model turns with full
    /// request/response data); append to history only.
    pub skip_unified_log: bool,
    pub depth: i64,
}

impl HistoryOptions {
    pub fn node(node_type: NodeType) -> Self {
        Self {
            node_type,
            trace_id: None,
            parent_id: None,
            metadata: Map::new(),
            skip_unified_log: false,
            depth: 0,
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_depth(mut self, depth: i64) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn skip_unified_log(mut self) -> Self {
        self.skip_unified_log = true;
        self
    }
}

struct EchoInner {
    parent_session_id: Option<String>,
    state: Map<String, Value>,
    history: Vec<Value>,
    lineage: Vec<LineageEntry>,
    errors: Vec<ErrorEntry>,
    current_cascade_id: Option<String>,
    current_phase_name: Option<String>,
    caller: CallerContext,
    last_mermaid: Option<String>,
    sink: Option<LogSink>,
    message_callback: Option<Arc<dyn Fn(&Value) + Send + Sync>>,
}

/// The session state object. Clone-able; clones share state.
#[derive(Clone)]
pub struct Echo {
    session_id: String,
    inner: Arc<Mutex<EchoInner>>,
}

impl Echo {
    pub fn new(session_id: impl Into<String>, parent_session_id: Option<String>) -> Self {
        let session_id = session_id.into();
        debug!(%session_id, ?parent_session_id, "Echo::new");
        Self {
            session_id,
            inner: Arc::new(Mutex::new(EchoInner {
                parent_session_id,
                state: Map::new(),
                history: Vec::new(),
                lineage: Vec::new(),
                errors: Vec::new(),
                current_cascade_id: None,
                current_phase_name: None,
                caller: CallerContext::default(),
                last_mermaid: None,
                sink: None,
                message_callback: None,
            })),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn parent_session_id(&self) -> Option<String> {
        self.lock().parent_session_id.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EchoInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach the log sink this Echo forwards history appends to
    pub fn set_sink(&self, sink: LogSink) {
        self.lock().sink = Some(sink);
    }

    pub fn set_cascade_context(&self, cascade_id: Option<String>) {
        self.lock().current_cascade_id = cascade_id;
    }

    pub fn set_phase_context(&self, phase_name: Option<String>) {
        self.lock().current_phase_name = phase_name;
    }

    pub fn current_phase(&self) -> Option<String> {
        self.lock().current_phase_name.clone()
    }

    pub fn set_caller(&self, caller: CallerContext) {
        self.lock().caller = caller;
    }

    pub fn caller(&self) -> CallerContext {
        self.lock().caller.clone()
    }

    /// Per-message callback (durable memory hooks). Errors in the callback
    /// never propagate.
    pub fn set_message_callback(&self, callback: Arc<dyn Fn(&Value) + Send + Sync>) {
        self.lock().message_callback = Some(callback);
    }

    pub fn update_state(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        debug!(session_id = %self.session_id, %key, "Echo::update_state");
        self.lock().state.insert(key, value);
    }

    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.lock().state.get(key).cloned()
    }

    pub fn state_snapshot(&self) -> Map<String, Value> {
        self.lock().state.clone()
    }

    /// Append an entry to history, stamped with trace fields and the current
    /// cascade/phase context, and forward it to the log sink.
    ///
    /// The caller's value is copied before stamping: callers reuse the same
    /// message objects for model requests, where trace fields would be
    /// rejected. Returns the entry's trace id.
    pub fn add_history(&self, entry: &Value, opts: HistoryOptions) -> String {
        let trace_id = opts
            .trace_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        debug!(session_id = %self.session_id, %trace_id, node_type = %opts.node_type, "Echo::add_history");

        let mut enriched = match entry {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("content".to_string(), other.clone());
                map
            }
        };

        enriched.insert("trace_id".to_string(), json!(trace_id));
        enriched.insert("parent_id".to_string(), json!(opts.parent_id));
        enriched.insert("node_type".to_string(), json!(opts.node_type.as_str()));

        let mut meta = opts.metadata.clone();
        let (record, callback, sink) = {
            let mut inner = self.lock();
            if let Some(cascade_id) = &inner.current_cascade_id {
                meta.entry("cascade_id".to_string()).or_insert(json!(cascade_id));
            }
            if let Some(phase_name) = &inner.current_phase_name {
                meta.entry("phase_name".to_string()).or_insert(json!(phase_name));
            }
            enriched.insert("metadata".to_string(), Value::Object(meta.clone()));
            inner.history.push(Value::Object(enriched.clone()));

            let callback = inner.message_callback.clone();
            if opts.skip_unified_log {
                (None, callback, None)
            } else {
                let record = build_record(&self.session_id, &mut inner, &enriched, &meta, &opts, &trace_id);
                let sink = inner.sink.clone();
                (Some(record), callback, sink)
            }
        };

        if let (Some(record), Some(sink)) = (record, sink) {
            sink.log(record);
        }

        if let Some(callback) = callback {
            callback(entry);
        }

        trace_id
    }

    pub fn add_lineage(&self, phase: impl Into<String>, output: Value, trace_id: Option<String>) {
        let phase = phase.into();
        debug!(session_id = %self.session_id, %phase, "Echo::add_lineage");
        self.lock().lineage.push(LineageEntry {
            phase,
            output,
            trace_id,
        });
    }

    pub fn add_error(
        &self,
        phase: impl Into<String>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        metadata: Value,
    ) {
        let phase = phase.into();
        let error_type = error_type.into();
        debug!(session_id = %self.session_id, %phase, %error_type, "Echo::add_error");
        self.lock().errors.push(ErrorEntry {
            phase,
            error_type,
            error_message: error_message.into(),
            metadata,
        });
    }

    /// Merge a completed sub-cascade's Echo into this one: state overlays,
    /// lineage and errors append, history lands under a `sub_echo` marker.
    pub fn merge(&self, child: &Echo) {
        debug!(session_id = %self.session_id, child = %child.session_id, "Echo::merge");
        let child_snapshot = child.snapshot();
        let mut inner = self.lock();
        for (key, value) in child_snapshot.state {
            inner.state.insert(key, value);
        }
        inner.lineage.extend(child_snapshot.lineage);
        inner.errors.extend(child_snapshot.errors);
        inner.history.push(json!({
            "sub_echo": child.session_id(),
            "history": child_snapshot.history,
        }));
    }

    pub fn history(&self) -> Vec<Value> {
        self.lock().history.clone()
    }

    pub fn lineage(&self) -> Vec<LineageEntry> {
        self.lock().lineage.clone()
    }

    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.lock().errors.clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.lock().errors.is_empty()
    }

    /// Full snapshot with derived status
    pub fn snapshot(&self) -> EchoSnapshot {
        let inner = self.lock();
        let has_errors = !inner.errors.is_empty();
        EchoSnapshot {
            session_id: self.session_id.clone(),
            state: inner.state.clone(),
            history: inner.history.clone(),
            lineage: inner.lineage.clone(),
            errors: inner.errors.clone(),
            has_errors,
            status: if has_errors { "failed" } else { "success" }.to_string(),
        }
    }
}

/// Assemble the unified log record for a freshly-appended entry.
///
/// The mermaid snapshot keeps continuity: generation failure reuses the last
/// good diagram rather than logging a null.
fn build_record(
    session_id: &str,
    inner: &mut EchoInner,
    enriched: &Map<String, Value>,
    meta: &Map<String, Value>,
    opts: &HistoryOptions,
    trace_id: &str,
) -> LogRecord {
    let content = enriched.get("content").cloned();
    let role = enriched.get("role").and_then(|v| v.as_str()).map(String::from);
    let tool_calls = enriched.get("tool_calls").cloned().filter(|v| !v.is_null());

    let has_base64 = content.as_ref().map(detect_base64_in_content);
    let images = content.as_ref().filter(|c| c.is_object()).map(extract_image_paths);
    let audio = content.as_ref().filter(|c| c.is_object()).map(extract_audio_paths);

    let mermaid = match state_diagram(&inner.history, &inner.errors) {
        Some(diagram) => {
            inner.last_mermaid = Some(diagram.clone());
            Some(diagram)
        }
        None => inner.last_mermaid.clone(),
    };

    let meta_str = |key: &str| meta.get(key).and_then(|v| v.as_str()).map(String::from);
    let meta_i64 = |key: &str| meta.get(key).and_then(|v| v.as_i64());
    let meta_bool = |key: &str| meta.get(key).and_then(|v| v.as_bool());

    LogRecord {
        session_id: session_id.to_string(),
        parent_session_id: inner.parent_session_id.clone(),
        caller_id: inner.caller.caller_id.clone(),
        invocation_metadata: inner.caller.invocation_metadata.clone(),
        trace_id: trace_id.to_string(),
        parent_id: opts.parent_id.clone(),
        node_type: opts.node_type.clone(),
        role,
        semantic_actor: meta_str("semantic_actor"),
        semantic_purpose: meta_str("semantic_purpose"),
        depth: opts.depth,
        cascade_id: meta_str("cascade_id"),
        cascade_file: meta_str("cascade_file"),
        cell_name: meta_str("phase_name"),
        phase_name: meta_str("phase_name"),
        turn_number: meta_i64("turn_number"),
        attempt_number: meta_i64("attempt_number"),
        sounding_index: meta_i64("sounding_index"),
        is_winner: meta_bool("is_winner"),
        reforge_step: meta_i64("reforge_step"),
        species_hash: meta_str("species_hash"),
        mutation_applied: meta_str("mutation_applied"),
        mutation_type: meta_str("mutation_type"),
        mutation_template: meta_str("mutation_template"),
        is_callout: meta_bool("is_callout"),
        callout_name: meta_str("callout_name"),
        content,
        tool_calls,
        images: images.filter(|v| !v.is_empty()),
        audio: audio.filter(|v| !v.is_empty()),
        has_base64,
        model: meta_str("model"),
        provider: meta_str("provider"),
        request_id: meta_str("request_id"),
        duration_ms: meta_i64("duration_ms"),
        tokens_in: meta_i64("tokens_in"),
        tokens_out: meta_i64("tokens_out"),
        tokens_reasoning: meta_i64("tokens_reasoning"),
        cost: meta.get("cost").and_then(|v| v.as_f64()),
        mermaid_content: mermaid,
        metadata: Some(Value::Object(meta.clone())),
        timestamp: chrono::Utc::now(),
    }
}

// === Process-wide session registry ===

static SESSIONS: OnceLock<RwLock<HashMap<String, Echo>>> = OnceLock::new();

fn sessions() -> &'static RwLock<HashMap<String, Echo>> {
    SESSIONS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Initialise the session registry. Idempotent.
pub fn init_sessions() {
    let _ = sessions();
}

/// Drop every registered session
pub fn shutdown_sessions() {
    if let Some(lock) = SESSIONS.get() {
        lock.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Fetch or create the Echo for a session id
pub fn get_echo(session_id: &str, parent_session_id: Option<&str>) -> Echo {
    let map = sessions();
    if let Some(echo) = map.read().unwrap_or_else(|e| e.into_inner()).get(session_id) {
        debug!(%session_id, "get_echo: reusing existing session");
        return echo.clone();
    }
    debug!(%session_id, "get_echo: creating new session");
    let echo = Echo::new(session_id, parent_session_id.map(String::from));
    map.write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(session_id.to_string(), echo.clone());
    echo
}

/// Look up an existing session without creating one
pub fn lookup_session(session_id: &str) -> Option<Echo> {
    sessions()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(session_id)
        .cloned()
}
