//! Caller context - correlates work with its originating external request
//!
//! A caller id (e.g. `sql-3f2a`) plus free-form invocation metadata travels
//! with every tool call and model request a session makes, so background
//! enrichment and card generation can be traced back to the request that
//! caused them. The context is always copied explicitly when crossing a
//! task boundary; nothing is inherited implicitly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerContext {
    /// Identifier of the originating external request
    pub caller_id: Option<String>,

    /// Protocol-specific detail (protocol, query text, source column/row...)
    pub invocation_metadata: Option<Value>,
}

impl CallerContext {
    pub fn new(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: Some(caller_id.into()),
            invocation_metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.invocation_metadata = Some(metadata);
        self
    }

    /// An explicit copy for handing to a spawned task. Same data; the method
    /// exists to make the crossing visible at call sites.
    pub fn for_task(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_task_copies() {
        let ctx = CallerContext::new("sql-1234").with_metadata(serde_json::json!({"protocol": "postgres"}));
        let copy = ctx.for_task();
        assert_eq!(copy.caller_id.as_deref(), Some("sql-1234"));
        assert_eq!(copy.invocation_metadata, ctx.invocation_metadata);
    }
}
