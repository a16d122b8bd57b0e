//! SQL-function surface - cascades invoked as UDFs
//!
//! The SQL wire server is an external collaborator; this module implements
//! the contract it consumes: invoke a cascade by id with JSON inputs,
//! receive a value. On top of the plain call it layers:
//!
//! - embedded `__LARS_TAKES:{...}__` override extraction from string inputs
//! - embedded `__LARS_SOURCE:{...}__` lineage extraction, surfaced as
//!   `invocation_metadata.source`
//! - a two-tier result cache (L1 in-memory LRU, optional external L2) keyed
//!   by content hash, structure hash, or string fingerprint, with `cache_as`
//!   aliasing so several SQL functions can share one cache
//! - `sql_execute` / `sql_statement` output modes, where the cached
//!   artifact is the SQL the cascade wrote, not the value it evaluates to

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cascade::ConfigSource;
use crate::context::CallerContext;
use crate::runner::{CascadeRunner, RunOptions};

const TAKES_PREFIX: &str = "__LARS_TAKES:";
const SOURCE_PREFIX: &str = "__LARS_SOURCE:";

/// How invocations map onto cache keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Exact input content
    #[default]
    Content,
    /// JSON shape with values replaced by type tags
    Structure,
    /// Format-preserving character-class pattern of a string input
    Fingerprint,
}

/// What the cascade's answer means to SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// The cascade's result is the value
    #[default]
    Value,
    /// The cascade returns a SQL expression; the runtime binds the original
    /// args and executes it for the scalar. The SQL is cached, not the value.
    SqlExecute,
    /// The cascade returns a full SQL statement; table results land in a
    /// temp JSON file for `read_json_auto`
    SqlStatement,
}

/// One registered SQL function
#[derive(Debug, Clone)]
pub struct SqlFunctionDef {
    pub name: String,
    pub cascade: ConfigSource,
    pub cache_strategy: CacheStrategy,
    /// Alias letting multiple functions share one cache namespace
    pub cache_as: Option<String>,
    pub output_mode: OutputMode,
}

/// Second cache tier (e.g. a shared external store)
pub trait ExternalCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn put(&self, key: &str, value: &Value);
}

/// Executes cascade-written SQL against the host engine
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute_scalar(&self, sql: &str, args: &Value) -> eyre::Result<Value>;
    async fn execute_table(&self, sql: &str) -> eyre::Result<Vec<Value>>;
}

/// Strip an embedded takes override from a string input.
/// `"__LARS_TAKES:{\"factor\":3}__actual input"` -> `("actual input", Some({...}))`
pub fn extract_embedded_takes(input: &str) -> (String, Option<Value>) {
    extract_prefix(input, TAKES_PREFIX)
}

/// Strip an embedded source-lineage marker from a string input
pub fn extract_embedded_source(input: &str) -> (String, Option<Value>) {
    extract_prefix(input, SOURCE_PREFIX)
}

fn extract_prefix(input: &str, prefix: &str) -> (String, Option<Value>) {
    let Some(start) = input.find(prefix) else {
        return (input.to_string(), None);
    };
    let after = &input[start + prefix.len()..];
    let Some(end) = after.find("__") else {
        return (input.to_string(), None);
    };
    let payload = &after[..end];
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => {
            let cleaned = format!("{}{}", &input[..start], &after[end + 2..]);
            (cleaned, Some(value))
        }
        Err(_) => (input.to_string(), None),
    }
}

/// Cache key from exact content
pub fn content_hash_key(inputs: &Value) -> String {
    sha_hex(canonical_json(inputs).as_bytes())
}

/// Cache key from JSON shape: values are replaced by type tags, so inputs
/// that differ only in values share a key
pub fn structure_hash_key(inputs: &Value) -> String {
    sha_hex(canonical_json(&type_shape(inputs)).as_bytes())
}

/// Cache key from a format-preserving pattern of a string: digits become
/// `9`, uppercase `A`, lowercase `a`; punctuation survives. `"AB-1234"` and
/// `"XY-9876"` share a key.
pub fn fingerprint_key(input: &str) -> String {
    let pattern: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                '9'
            } else if c.is_ascii_uppercase() {
                'A'
            } else if c.is_ascii_lowercase() {
                'a'
            } else {
                c
            }
        })
        .collect();
    sha_hex(pattern.as_bytes())
}

fn type_shape(value: &Value) -> Value {
    match value {
        Value::Null => json!("null"),
        Value::Bool(_) => json!("bool"),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                json!("int")
            } else {
                json!("float")
            }
        }
        Value::String(_) => json!("str"),
        Value::Array(items) => Value::Array(items.iter().map(type_shape).collect()),
        Value::Object(map) => {
            let mut shaped = serde_json::Map::new();
            for (key, item) in map {
                shaped.insert(key.clone(), type_shape(item));
            }
            Value::Object(shaped)
        }
    }
}

/// Deterministic serialization: object keys sorted
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", json!(key), canonical_json(&map[key])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

fn sha_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Two-tier cache: in-process LRU in front of an optional external store
pub struct UdfCache {
    l1: Mutex<LruCache<String, Value>>,
    l2: Option<Arc<dyn ExternalCache>>,
}

impl UdfCache {
    pub fn new(capacity: usize, l2: Option<Arc<dyn ExternalCache>>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            l1: Mutex::new(LruCache::new(capacity)),
            l2,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(hit) = self.l1.lock().unwrap_or_else(|e| e.into_inner()).get(key) {
            return Some(hit.clone());
        }
        let from_l2 = self.l2.as_ref()?.get(key)?;
        // Promote into L1
        self.l1
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key.to_string(), from_l2.clone());
        Some(from_l2)
    }

    pub fn put(&self, key: &str, value: &Value) {
        self.l1
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key.to_string(), value.clone());
        if let Some(l2) = &self.l2 {
            l2.put(key, value);
        }
    }
}

/// Runs cascades on behalf of SQL functions
pub struct SqlFunctionRunner {
    runner: CascadeRunner,
    cache: UdfCache,
    executor: Option<Arc<dyn SqlExecutor>>,
}

impl SqlFunctionRunner {
    pub fn new(runner: CascadeRunner, cache: UdfCache, executor: Option<Arc<dyn SqlExecutor>>) -> Self {
        Self {
            runner,
            cache,
            executor,
        }
    }

    /// Invoke a cascade as a SQL function.
    ///
    /// `soundings disabled on cache`: a cache hit bypasses the cascade
    /// entirely; fresh sampling happens only on misses.
    pub async fn run_udf(&self, def: &SqlFunctionDef, inputs: Value, caller: CallerContext) -> eyre::Result<Value> {
        // Extract embedded directives from string inputs before anything
        // else keys on the content
        let (inputs, takes, source) = strip_embedded(inputs);

        let namespace = def.cache_as.as_deref().unwrap_or(&def.name);
        let key = format!("{namespace}:{}", self.cache_key(def, &inputs));

        if let Some(cached) = self.cache.get(&key) {
            debug!(function = %def.name, %key, "run_udf: cache hit");
            return self.materialize(def, cached, &inputs).await;
        }

        info!(function = %def.name, "run_udf: cache miss, invoking cascade");
        let mut metadata = json!({"protocol": "sql", "function": def.name});
        if let Some(source) = source {
            metadata["source"] = source;
        }
        let caller = CallerContext {
            caller_id: caller
                .caller_id
                .or_else(|| Some(format!("sql-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))),
            invocation_metadata: Some(metadata),
        };

        let result = self
            .runner
            .run(
                def.cascade.clone(),
                inputs.clone(),
                RunOptions {
                    session_id: None,
                    parent_session_id: None,
                    caller,
                    overrides: takes.map(|t| json!({"takes": t})),
                    depth: 0,
                },
            )
            .await?;

        if result.status != "success" {
            let detail = result
                .errors
                .last()
                .map(|e| e.error_message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(eyre::eyre!("SQL function '{}' cascade failed: {detail}", def.name));
        }

        let value = result.result.unwrap_or(Value::Null);
        // For SQL output modes the cached artifact is the SQL text itself
        self.cache.put(&key, &value);
        self.materialize(def, value, &inputs).await
    }

    fn cache_key(&self, def: &SqlFunctionDef, inputs: &Value) -> String {
        match def.cache_strategy {
            CacheStrategy::Content => content_hash_key(inputs),
            CacheStrategy::Structure => structure_hash_key(inputs),
            CacheStrategy::Fingerprint => match inputs {
                Value::String(s) => fingerprint_key(s),
                other => fingerprint_key(&other.to_string()),
            },
        }
    }

    /// Turn the cascade's (possibly cached) answer into the SQL-facing value
    async fn materialize(&self, def: &SqlFunctionDef, value: Value, args: &Value) -> eyre::Result<Value> {
        match def.output_mode {
            OutputMode::Value => Ok(value),
            OutputMode::SqlExecute => {
                let sql = value
                    .as_str()
                    .ok_or_else(|| eyre::eyre!("sql_execute cascade must return a SQL string"))?;
                let executor = self
                    .executor
                    .as_ref()
                    .ok_or_else(|| eyre::eyre!("no SQL executor configured for sql_execute mode"))?;
                executor.execute_scalar(sql, args).await
            }
            OutputMode::SqlStatement => {
                let sql = value
                    .as_str()
                    .ok_or_else(|| eyre::eyre!("sql_statement cascade must return a SQL string"))?;
                let executor = self
                    .executor
                    .as_ref()
                    .ok_or_else(|| eyre::eyre!("no SQL executor configured for sql_statement mode"))?;
                let rows = executor.execute_table(sql).await?;

                // Table results land in a temp JSON for read_json_auto
                let path = std::env::temp_dir().join(format!(
                    "helmsman_sqlfn_{}.json",
                    uuid::Uuid::new_v4().simple()
                ));
                std::fs::write(&path, serde_json::to_string(&rows)?)?;
                Ok(json!(format!("read_json_auto('{}')", path.display())))
            }
        }
    }
}

/// Pull embedded takes/source markers out of any string values in the input
fn strip_embedded(inputs: Value) -> (Value, Option<Value>, Option<Value>) {
    let mut takes = None;
    let mut source = None;

    let cleaned = match inputs {
        Value::String(s) => {
            let (s, t) = extract_embedded_takes(&s);
            let (s, src) = extract_embedded_source(&s);
            takes = t;
            source = src;
            Value::String(s)
        }
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::new();
            for (key, value) in map {
                match value {
                    Value::String(s) => {
                        let (s, t) = extract_embedded_takes(&s);
                        let (s, src) = extract_embedded_source(&s);
                        if takes.is_none() {
                            takes = t;
                        }
                        if source.is_none() {
                            source = src;
                        }
                        cleaned.insert(key, Value::String(s));
                    }
                    other => {
                        cleaned.insert(key, other);
                    }
                }
            }
            Value::Object(cleaned)
        }
        other => other,
    };

    (cleaned, takes, source)
}
