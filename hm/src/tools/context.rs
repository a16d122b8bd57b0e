//! ToolContext - execution context passed to every tool invocation

use crate::context::CallerContext;

/// What a tool knows about the call site.
///
/// The caller context is an owned copy, taken explicitly when the context is
/// built; tools that spawn tasks hand it on with another explicit copy.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub phase_name: Option<String>,
    pub caller: CallerContext,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            phase_name: None,
            caller: CallerContext::default(),
        }
    }

    pub fn with_phase(mut self, phase_name: impl Into<String>) -> Self {
        self.phase_name = Some(phase_name.into());
        self
    }

    pub fn with_caller(mut self, caller: CallerContext) -> Self {
        self.caller = caller;
        self
    }
}
