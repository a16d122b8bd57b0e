//! Tool dispatcher - invocation with caller-context propagation
//!
//! Native tools run in-process; cascade tools are handed to the cascade
//! invoker (the runner) and block the calling phase until the sub-cascade
//! returns. Failures are captured as `Error: ...` results rather than
//! raised, unless the tool is marked critical.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::context::ToolContext;
use super::registry::{CascadeToolSpec, ToolEntry, ToolRegistry};
use super::traits::{ToolError, ToolOutput};

/// Runs a cascade on behalf of a tool invocation. Implemented by the
/// cascade runner; injected after construction to break the runner <->
/// dispatcher cycle.
#[async_trait]
pub trait CascadeInvoker: Send + Sync {
    async fn invoke_cascade(
        &self,
        spec: &CascadeToolSpec,
        inputs: Value,
        ctx: &ToolContext,
    ) -> eyre::Result<Value>;
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    invoker: RwLock<Option<Arc<dyn CascadeInvoker>>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            invoker: RwLock::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Wire in the cascade invoker (done once at runtime assembly)
    pub fn set_invoker(&self, invoker: Arc<dyn CascadeInvoker>) {
        *self.invoker.write().unwrap_or_else(|e| e.into_inner()) = Some(invoker);
    }

    /// Invoke a tool by name.
    ///
    /// Returns `Err` only for unknown tools reported by critical paths and
    /// critical-tool failures; every other failure is folded into an
    /// `Error: ...` output so the model can react to it.
    pub async fn invoke(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        debug!(tool = %name, session_id = %ctx.session_id, "ToolDispatcher::invoke");

        let entry = match self.registry.get(name) {
            Some(entry) => entry,
            None => {
                warn!(tool = %name, "invoke: unknown tool");
                return Ok(ToolOutput::error(format!("Unknown tool: {name}")));
            }
        };

        match entry {
            ToolEntry::Native(tool) => match tool.invoke(args, ctx).await {
                Ok(output) => Ok(output),
                Err(e) if tool.critical() => Err(ToolError::Critical {
                    tool: name.to_string(),
                    reason: e.to_string(),
                }),
                Err(e) => {
                    warn!(tool = %name, error = %e, "invoke: captured tool failure");
                    Ok(ToolOutput::error(e))
                }
            },
            ToolEntry::Cascade(spec) => {
                let invoker = self
                    .invoker
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                let Some(invoker) = invoker else {
                    return Ok(ToolOutput::error("cascade tools are not available in this runtime"));
                };
                // The sub-cascade gets its own explicit copy of the caller
                // context; nothing is inherited implicitly.
                let sub_ctx = ToolContext {
                    session_id: ctx.session_id.clone(),
                    phase_name: ctx.phase_name.clone(),
                    caller: ctx.caller.for_task(),
                };
                match invoker.invoke_cascade(&spec, args, &sub_ctx).await {
                    Ok(value) => Ok(ToolOutput::json(value)),
                    Err(e) => {
                        warn!(tool = %name, error = %e, "invoke: sub-cascade failed");
                        Ok(ToolOutput::error(e))
                    }
                }
            }
        }
    }
}
