//! Tool registry - the open, growable catalog
//!
//! A name maps to either a native callable or a cascade definition invoked
//! as a sub-cascade; dispatch is by variant tag. The registry is populated
//! at startup: builtin natives first, then cascade-definition directories in
//! priority order (builtin cascades, user skills, user cascades - later
//! registrations win).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cascade::{ConfigSource, load_config};
use crate::config::ToolDirsConfig;
use crate::llm::ToolDefinition;

use super::traits::NativeTool;

/// A cascade registered as a tool
#[derive(Debug, Clone)]
pub struct CascadeToolSpec {
    pub cascade_id: String,
    pub description: String,
    pub source: ConfigSource,
    /// Argument schema, taken from the cascade's `inputs_schema`
    pub parameters: Value,
}

/// Registry entry: dispatch by tag
#[derive(Clone)]
pub enum ToolEntry {
    Native(Arc<dyn NativeTool>),
    Cascade(CascadeToolSpec),
}

impl ToolEntry {
    pub fn description(&self) -> String {
        match self {
            ToolEntry::Native(tool) => tool.description().to_string(),
            ToolEntry::Cascade(spec) => spec.description.clone(),
        }
    }

    pub fn parameters(&self) -> Value {
        match self {
            ToolEntry::Native(tool) => tool.parameters(),
            ToolEntry::Cascade(spec) => spec.parameters.clone(),
        }
    }
}

/// The process-wide tool catalog
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_native(&self, tool: Arc<dyn NativeTool>) {
        debug!(name = tool.name(), "ToolRegistry::register_native");
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool.name().to_string(), ToolEntry::Native(tool));
    }

    pub fn register_cascade(&self, spec: CascadeToolSpec) {
        debug!(name = %spec.cascade_id, "ToolRegistry::register_cascade");
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec.cascade_id.clone(), ToolEntry::Cascade(spec));
    }

    pub fn get(&self, name: &str) -> Option<ToolEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// `(name, description)` pairs for the quartermaster prompt
    pub fn catalog(&self) -> Vec<(String, String)> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut catalog: Vec<(String, String)> = entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.description()))
            .collect();
        catalog.sort();
        catalog
    }

    /// Model-facing definitions for a named subset; unknown names are
    /// skipped with a warning.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        names
            .iter()
            .filter_map(|name| match entries.get(name) {
                Some(entry) => Some(ToolDefinition {
                    name: name.clone(),
                    description: entry.description(),
                    parameters: entry.parameters(),
                }),
                None => {
                    warn!(%name, "definitions_for: tool not registered");
                    None
                }
            })
            .collect()
    }

    /// Scan a directory of cascade definitions and register each as a tool
    pub fn scan_cascade_dir(&self, dir: &Path) {
        debug!(dir = %dir.display(), "ToolRegistry::scan_cascade_dir");
        for extension in ["yaml", "yml", "json"] {
            let pattern = dir.join(format!("*.{extension}"));
            let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
                continue;
            };
            for path in paths.flatten() {
                self.register_cascade_file(&path);
            }
        }
    }

    fn register_cascade_file(&self, path: &PathBuf) {
        let source = ConfigSource::Path(path.clone());
        match load_config(&source) {
            Ok(config) => {
                let parameters = config
                    .inputs_schema
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                self.register_cascade(CascadeToolSpec {
                    cascade_id: config.cascade_id.clone(),
                    description: config.description.clone(),
                    source,
                    parameters,
                });
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid cascade definition"),
        }
    }
}

// === Process-wide registry with lifecycle hooks ===

static REGISTRY: OnceLock<Arc<ToolRegistry>> = OnceLock::new();

/// Initialise the global registry: builtin natives, then cascade directories
/// in priority order (later wins).
pub fn init_tools(dirs: &ToolDirsConfig) -> Arc<ToolRegistry> {
    let registry = REGISTRY.get_or_init(|| Arc::new(ToolRegistry::new())).clone();
    super::builtin::register_builtins(&registry);

    for dir in [&dirs.builtin_cascades, &dirs.user_skills, &dirs.user_cascades]
        .into_iter()
        .flatten()
    {
        registry.scan_cascade_dir(dir);
    }
    registry
}

/// The global registry, creating an empty one if `init_tools` never ran
pub fn global_registry() -> Arc<ToolRegistry> {
    REGISTRY.get_or_init(|| Arc::new(ToolRegistry::new())).clone()
}

/// Clear all registrations
pub fn shutdown_tools() {
    if let Some(registry) = REGISTRY.get() {
        registry
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
