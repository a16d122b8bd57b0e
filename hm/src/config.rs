//! Helmsman configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main Helmsman configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model provider configuration
    pub provider: ProviderConfig,

    /// Storage locations
    pub storage: StorageConfig,

    /// Soundings / parallel-attempt limits
    pub takes: TakesConfig,

    /// Cost enrichment
    pub cost: CostConfig,

    /// Context-card generation
    pub cards: CardsConfig,

    /// Log sink tuning
    pub sink: SinkConfig,

    /// Tool discovery directories
    pub tools: ToolDirsConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .helmsman.yml
        let local_config = PathBuf::from(".helmsman.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config.with_env_overrides()),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/helmsman/helmsman.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("helmsman").join("helmsman.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config.with_env_overrides()),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default().with_env_overrides())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply `HELMSMAN_*` environment overrides
    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("HELMSMAN_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("HELMSMAN_MODEL") {
            self.provider.default_model = model;
        }
        if let Ok(key_env) = std::env::var("HELMSMAN_API_KEY_ENV") {
            self.provider.api_key_env = key_env;
        }
        self
    }
}

/// Model provider configuration.
///
/// The API key is never stored in config; only the name of the environment
/// variable holding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Chat-completions base URL (OpenAI-compatible)
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// Default chat model when a phase names none
    #[serde(rename = "default-model")]
    pub default_model: String,

    /// Embedding model
    #[serde(rename = "embed-model")]
    pub embed_model: String,

    /// Speech-to-text model
    #[serde(rename = "stt-model")]
    pub stt_model: String,

    /// Model for quartermaster tool selection (cheap/fast)
    #[serde(rename = "quartermaster-model")]
    pub quartermaster_model: String,

    /// Model for soundings evaluation when a phase names none
    #[serde(rename = "evaluator-model")]
    pub evaluator_model: String,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Maximum completion tokens per request
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,
}

impl ProviderConfig {
    /// Resolve the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env)
            .context(format!("API key environment variable {} not set", self.api_key_env))
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            default_model: "anthropic/claude-sonnet-4".to_string(),
            embed_model: "openai/text-embedding-3-small".to_string(),
            stt_model: "google/gemini-2.5-flash".to_string(),
            quartermaster_model: "google/gemini-2.5-flash-lite".to_string(),
            evaluator_model: "google/gemini-2.5-flash".to_string(),
            timeout_ms: 300_000,
            max_tokens: 16384,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Unified log database
    #[serde(rename = "log-db")]
    pub log_db: PathBuf,

    /// Context-card database
    #[serde(rename = "card-db")]
    pub card_db: PathBuf,

    /// Directory for generated images (session/cell scoped subdirs)
    #[serde(rename = "image-dir")]
    pub image_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_db: PathBuf::from(".helmsman/logs.db"),
            card_db: PathBuf::from(".helmsman/cards.db"),
            image_dir: PathBuf::from(".helmsman/images"),
        }
    }
}

/// Soundings limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TakesConfig {
    /// Maximum concurrent sounding attempts
    #[serde(rename = "max-parallel")]
    pub max_parallel: usize,
}

impl Default for TakesConfig {
    fn default() -> Self {
        Self { max_parallel: 8 }
    }
}

/// Cost enrichment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub enabled: bool,

    /// Delay before the first usage poll; providers need a few seconds
    #[serde(rename = "initial-delay-ms")]
    pub initial_delay_ms: u64,

    /// Attempts before giving up on a request id
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 4000,
            max_attempts: 5,
        }
    }
}

/// Context-card generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CardsConfig {
    pub enabled: bool,
    pub workers: usize,
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
}

impl Default for CardsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            batch_size: 10,
        }
    }
}

/// Log sink tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Queue depth above which producers back off
    #[serde(rename = "high-water")]
    pub high_water: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self { high_water: 10_000 }
    }
}

/// Tool discovery directories, scanned in priority order (later wins)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolDirsConfig {
    /// Builtin cascade definitions shipped with the runtime
    #[serde(rename = "builtin-cascades")]
    pub builtin_cascades: Option<PathBuf>,

    /// User skill directories
    #[serde(rename = "user-skills")]
    pub user_skills: Option<PathBuf>,

    /// User cascade definitions
    #[serde(rename = "user-cascades")]
    pub user_cascades: Option<PathBuf>,
}

impl Default for ToolDirsConfig {
    fn default() -> Self {
        Self {
            builtin_cascades: None,
            user_skills: None,
            user_cascades: None,
        }
    }
}
