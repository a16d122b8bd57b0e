//! Builtin tools shipped with the runtime

mod say;
mod signal_tools;
mod state_tools;

use std::sync::Arc;

pub use say::{LogSpeaker, RecordingSpeaker, SayTool, Speaker};
pub use signal_tools::{AwaitSignalTool, FireSignalTool, ListSignalsTool};
pub use state_tools::SetStateTool;

use super::registry::ToolRegistry;

/// Register every builtin native tool
pub fn register_builtins(registry: &ToolRegistry) {
    registry.register_native(Arc::new(SetStateTool));
    registry.register_native(Arc::new(AwaitSignalTool));
    registry.register_native(Arc::new(FireSignalTool));
    registry.register_native(Arc::new(ListSignalsTool));
    registry.register_native(Arc::new(SayTool::default()));
}
