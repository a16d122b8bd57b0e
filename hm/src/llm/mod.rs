//! Model client: uniform interface to chat, embedding, speech-to-text and
//! image-generation endpoints
//!
//! The model spec grammar (`provider/model[:variant][::reasoning]`) is
//! parsed in [`reasoning`]; outbound histories are cleaned in [`sanitize`].

pub mod client;
mod error;
mod openrouter;
pub mod provider;
pub mod reasoning;
pub mod sanitize;
mod types;

use std::sync::Arc;

use tracing::debug;

pub use client::ModelClient;
pub use error::ModelError;
pub use openrouter::OpenRouterClient;
pub use reasoning::{ReasoningConfig, format_model_spec, parse_model_spec};
pub use sanitize::sanitize_messages;
pub use types::{
    ChatRequest, EmbeddingBatch, FunctionCall, GeneratedImages, ImageRequest, ModelTurn, ToolCallPayload,
    ToolDefinition, Transcription, TranscribeRequest,
};

use crate::config::Config;

/// Create the model client for the configured gateway
pub fn create_client(config: &Config) -> Result<Arc<dyn ModelClient>, ModelError> {
    debug!(base_url = %config.provider.base_url, "create_client");
    Ok(Arc::new(OpenRouterClient::from_config(&config.provider, &config.storage)?))
}

/// Adapter exposing the model client's embedding endpoint through the
/// card store's [`cardstore::Embedder`] seam.
pub struct ModelEmbedder {
    client: Arc<dyn ModelClient>,
    model: Option<String>,
}

impl ModelEmbedder {
    pub fn new(client: Arc<dyn ModelClient>, model: Option<String>) -> Self {
        Self { client, model }
    }
}

#[async_trait::async_trait]
impl cardstore::Embedder for ModelEmbedder {
    async fn embed(&self, texts: &[String]) -> eyre::Result<Vec<Vec<f32>>> {
        let batch = self
            .client
            .embed(texts, self.model.as_deref())
            .await
            .map_err(|e| eyre::eyre!(e.to_string()))?;
        Ok(batch.embeddings)
    }
}
