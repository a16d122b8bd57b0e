//! Model client errors

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Transient; the client retries these itself before surfacing
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Duration },

    /// Non-transient provider error. Carries the outbound request so the
    /// failure can be logged with full forensics.
    #[error("Model API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        request: Option<Box<Value>>,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Audio transcode failed: {0}")]
    Transcode(String),

    #[error("Operation not supported by this client: {0}")]
    Unsupported(&'static str),
}

impl ModelError {
    /// Human-readable message with whatever detail the provider gave us.
    /// Providers sometimes return empty or truncated messages on parsing
    /// failures; this fills in from the response body when present.
    pub fn enhanced_message(&self) -> String {
        match self {
            ModelError::Api { status, message, .. } => {
                if message.trim().is_empty() {
                    format!(
                        "HTTP {status} with no error details (possible response parsing failure or transient issue)"
                    )
                } else {
                    format!("HTTP {status}: {message}")
                }
            }
            other => other.to_string(),
        }
    }

    /// The outbound request payload, when captured
    pub fn request_payload(&self) -> Option<&Value> {
        match self {
            ModelError::Api { request, .. } => request.as_deref(),
            _ => None,
        }
    }

    /// Machine-friendly classification for error records
    pub fn error_type(&self) -> &'static str {
        match self {
            ModelError::RateLimited { .. } => "model_rate_limit",
            ModelError::Api { .. } => "model_api_error",
            ModelError::Network(_) => "model_api_error",
            ModelError::InvalidResponse(_) => "model_api_error",
            ModelError::Transcode(_) => "error",
            ModelError::Unsupported(_) => "error",
        }
    }
}
