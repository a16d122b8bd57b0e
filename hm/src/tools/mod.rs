//! Tool system: registry, dispatcher and builtins
//!
//! The catalog is open and growable at runtime: a name maps to a native
//! callable or to a cascade invoked as a sub-cascade, and dispatch goes by
//! variant tag. Caller context travels with every invocation.

pub mod builtin;
mod context;
mod dispatcher;
mod quartermaster;
mod registry;
mod traits;

pub use context::ToolContext;
pub use dispatcher::{CascadeInvoker, ToolDispatcher};
pub use quartermaster::{QuartermasterResult, select_tackle};
pub use registry::{CascadeToolSpec, ToolEntry, ToolRegistry, global_registry, init_tools, shutdown_tools};
pub use traits::{NativeTool, ToolError, ToolOutput};
