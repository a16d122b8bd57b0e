//! OpenAI-compatible chat-completions client (OpenRouter-style gateways)
//!
//! One client covers chat turns, embeddings, speech-to-text and image
//! generation against a single gateway base URL. Reasoning config parsed
//! from the model spec rides in the request's `reasoning` payload.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{ProviderConfig, StorageConfig};

use super::provider::{extract_provider, is_free_provider};
use super::reasoning::{ReasoningConfig, parse_model_spec};
use super::sanitize::sanitize_messages;
use super::{
    ChatRequest, EmbeddingBatch, GeneratedImages, ImageRequest, ModelClient, ModelError, ModelTurn, Transcription,
    TranscribeRequest,
};

/// Rate-limit retries before surfacing the error
const RATE_LIMIT_RETRIES: u32 = 2;

/// Texts per embeddings request
const EMBED_BATCH_SIZE: usize = 50;

const EMBED_RETRIES: u32 = 3;

pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    image_dir: PathBuf,
    embed_model: String,
    stt_model: String,
    max_tokens: u32,
}

impl OpenRouterClient {
    pub fn from_config(provider: &ProviderConfig, storage: &StorageConfig) -> Result<Self, ModelError> {
        debug!(base_url = %provider.base_url, "OpenRouterClient::from_config");
        let api_key = provider
            .api_key()
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(provider.timeout_ms))
            .build()
            .map_err(ModelError::Network)?;

        Ok(Self {
            http,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            api_key,
            image_dir: storage.image_dir.clone(),
            embed_model: provider.embed_model.clone(),
            stt_model: provider.stt_model.clone(),
            max_tokens: provider.max_tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response, ModelError> {
        self.http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(ModelError::Network)
    }

    fn build_chat_body(&self, request: &ChatRequest, model: &str, reasoning: Option<&ReasoningConfig>) -> Value {
        let mut messages = Vec::new();
        if !request.system.trim().is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        messages.extend(request.history.iter().cloned());
        if let Some(user) = &request.user {
            messages.push(json!({"role": "user", "content": user}));
        }
        let messages = sanitize_messages(&messages, request.use_native_tools);

        let mut body = json!({
            "model": model,
            "messages": messages,
            // Default cap avoids silent truncation on large outputs
            "max_tokens": self.max_tokens,
        });

        if !request.tools.is_empty() && request.use_native_tools {
            body["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| t.to_openai_schema())
                    .collect::<Vec<_>>()
            );
            body["tool_choice"] = json!("auto");
        }

        if let Some(reasoning) = reasoning {
            body["reasoning"] = reasoning.to_api_value();
        }

        if let Some(modalities) = &request.modalities {
            body["modalities"] = json!(modalities);
        }

        body
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn run(&self, request: ChatRequest) -> Result<ModelTurn, ModelError> {
        let (model, reasoning) = parse_model_spec(&request.model_spec);
        debug!(%model, reasoning = ?reasoning, "OpenRouterClient::run");

        let body = self.build_chat_body(&request, &model, reasoning.as_ref());
        let url = self.url("chat/completions");

        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let response = self.post(&url, &body).await?;
            let status = response.status().as_u16();

            if status == 429 && attempt < RATE_LIMIT_RETRIES {
                attempt += 1;
                let backoff = Duration::from_secs(2 * attempt as u64);
                warn!(attempt, ?backoff, "run: rate limited, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }
            if status == 429 {
                return Err(ModelError::RateLimited {
                    retry_after: Duration::from_secs(60),
                });
            }
            if !response.status().is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ModelError::Api {
                    status,
                    message: truncate(&message, 1000),
                    request: Some(Box::new(body)),
                });
            }

            let duration_ms = started.elapsed().as_millis() as i64;
            let payload: Value = response.json().await.map_err(ModelError::Network)?;
            return parse_chat_response(&request, &model, reasoning, body, payload, duration_ms);
        }
    }

    async fn embed(&self, texts: &[String], model: Option<&str>) -> Result<EmbeddingBatch, ModelError> {
        let embed_model = model.unwrap_or(&self.embed_model).to_string();
        debug!(%embed_model, count = texts.len(), "OpenRouterClient::embed");
        let url = self.url("embeddings");

        let mut all_vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        let mut total_tokens = 0i64;
        let mut last_request_id = None;
        let mut model_used = embed_model.clone();
        let mut dim = 0usize;

        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let body = json!({"model": embed_model, "input": batch});

            let mut last_error: Option<ModelError> = None;
            let mut batch_done = false;
            for attempt in 0..EMBED_RETRIES {
                if attempt > 0 {
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                let response = match self.post(&url, &body).await {
                    Ok(r) => r,
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                };
                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let message = response.text().await.unwrap_or_default();
                    last_error = Some(ModelError::Api {
                        status,
                        message: truncate(&message, 500),
                        request: None,
                    });
                    continue;
                }
                let data: Value = response.json().await.map_err(ModelError::Network)?;
                let rows = data["data"]
                    .as_array()
                    .ok_or_else(|| ModelError::InvalidResponse(format!("no embedding data: {}", truncate(&data.to_string(), 200))))?;
                for row in rows {
                    let vector: Vec<f32> = row["embedding"]
                        .as_array()
                        .map(|values| values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                        .unwrap_or_default();
                    if vector.is_empty() {
                        return Err(ModelError::InvalidResponse("empty embedding vector".to_string()));
                    }
                    if dim == 0 {
                        dim = vector.len();
                    }
                    all_vectors.push(vector);
                }
                last_request_id = data["id"].as_str().map(String::from);
                total_tokens += data["usage"]["total_tokens"].as_i64().unwrap_or(0);
                if let Some(served) = data["model"].as_str() {
                    model_used = served.to_string();
                }
                batch_done = true;
                break;
            }
            if !batch_done {
                return Err(last_error.unwrap_or_else(|| ModelError::InvalidResponse("embedding retries exhausted".to_string())));
            }
        }

        let provider = extract_provider(&embed_model).to_string();
        Ok(EmbeddingBatch {
            embeddings: all_vectors,
            model: model_used,
            dim,
            request_id: last_request_id,
            tokens: total_tokens,
            provider,
        })
    }

    async fn transcribe(&self, request: TranscribeRequest) -> Result<Transcription, ModelError> {
        let model = request.model.clone().unwrap_or_else(|| self.stt_model.clone());
        debug!(%model, format = %request.format, "OpenRouterClient::transcribe");

        // Most audio APIs reject webm/ogg; convert to 16 kHz mono wav first
        let (audio_base64, format) = if matches!(request.format.as_str(), "webm" | "ogg") {
            convert_audio_to_wav(&request.audio_base64, &request.format).await?
        } else {
            (request.audio_base64.clone(), request.format.clone())
        };

        let mut system = String::from(
            "You are a speech-to-text transcription assistant. Transcribe the audio accurately. \
             Output ONLY the transcribed text, nothing else - no explanations, no formatting, \
             no quotes around the text.",
        );
        if let Some(language) = &request.language {
            system.push_str(&format!(" The audio is in {language}."));
        }
        if let Some(prompt) = &request.prompt {
            system.push_str(&format!(" Context: {prompt}"));
        }

        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": [
                    {"type": "text", "text": "Transcribe this audio."},
                    {"type": "input_audio", "input_audio": {"data": audio_base64, "format": format}}
                ]}
            ],
            "max_tokens": 4096,
            "temperature": 0.0,
        });

        let response = self.post(&self.url("chat/completions"), &body).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status,
                message: truncate(&message, 500),
                request: None,
            });
        }

        let data: Value = response.json().await.map_err(ModelError::Network)?;
        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(Transcription {
            text,
            language: request.language.clone().unwrap_or_else(|| "auto".to_string()),
            model: data["model"].as_str().unwrap_or(&model).to_string(),
            request_id: data["id"].as_str().map(String::from),
            tokens_in: data["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
            tokens_out: data["usage"]["completion_tokens"].as_i64().unwrap_or(0),
            provider: extract_provider(&model).to_string(),
        })
    }

    async fn generate_image(&self, request: ImageRequest) -> Result<GeneratedImages, ModelError> {
        debug!(model = %request.model, n = request.n, "OpenRouterClient::generate_image");
        let started = Instant::now();

        let body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": request.n,
            "size": format!("{}x{}", request.width, request.height),
        });

        let response = self.post(&self.url("images/generations"), &body).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status,
                message: truncate(&message, 500),
                request: Some(Box::new(body)),
            });
        }

        let data: Value = response.json().await.map_err(ModelError::Network)?;
        let request_id = data["id"].as_str().map(String::from);

        let session = request.session_id.as_deref().unwrap_or("default");
        let cell = request.cell_name.as_deref().unwrap_or("image_gen");
        let target_dir = self.image_dir.join(session).join(cell);
        std::fs::create_dir_all(&target_dir)
            .map_err(|e| ModelError::InvalidResponse(format!("cannot create image dir: {e}")))?;

        let mut saved = Vec::new();
        let items = data["data"].as_array().cloned().unwrap_or_default();
        for item in items {
            let index = next_image_index(&target_dir);
            let filename = format!("image_{index}.png");
            let path = target_dir.join(&filename);

            if let Some(b64) = item["b64_json"].as_str() {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| ModelError::InvalidResponse(format!("bad image base64: {e}")))?;
                std::fs::write(&path, bytes)
                    .map_err(|e| ModelError::InvalidResponse(format!("cannot write image: {e}")))?;
            } else if let Some(url) = item["url"].as_str() {
                let bytes = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(ModelError::Network)?
                    .bytes()
                    .await
                    .map_err(ModelError::Network)?;
                std::fs::write(&path, &bytes)
                    .map_err(|e| ModelError::InvalidResponse(format!("cannot write image: {e}")))?;
            } else {
                continue;
            }

            saved.push(format!("/api/images/{session}/{cell}/{filename}"));
        }

        Ok(GeneratedImages {
            content: format!("Generated {} image(s) with {}", saved.len(), request.model),
            images: saved,
            model: request.model.clone(),
            request_id,
            provider: extract_provider(&request.model).to_string(),
            duration_ms: started.elapsed().as_millis() as i64,
        })
    }
}

/// Assemble a [`ModelTurn`] from a chat-completions payload
fn parse_chat_response(
    request: &ChatRequest,
    model: &str,
    reasoning: Option<ReasoningConfig>,
    full_request: Value,
    payload: Value,
    duration_ms: i64,
) -> Result<ModelTurn, ModelError> {
    let message = &payload["choices"][0]["message"];
    if message.is_null() {
        return Err(ModelError::InvalidResponse(format!(
            "response carries no message: {}",
            truncate(&payload.to_string(), 300)
        )));
    }

    let content = message["content"].as_str().unwrap_or_default().to_string();
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| serde_json::from_value(call.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let images = normalize_media(&message["images"], "image_url", "data:");
    let videos = normalize_media(&message["videos"], "video_url", "data:video");

    let usage = &payload["usage"];
    let tokens_in = usage["prompt_tokens"].as_i64().unwrap_or(0);
    let tokens_out = usage["completion_tokens"].as_i64().unwrap_or(0);
    let tokens_reasoning = usage["reasoning_tokens"]
        .as_i64()
        .or_else(|| usage["completion_tokens_details"]["reasoning_tokens"].as_i64());

    let served_model = payload["model"].as_str().unwrap_or(model).to_string();
    let provider = extract_provider(model).to_string();
    let cost = if is_free_provider(&provider) { Some(0.0) } else { None };

    let full_response = json!({
        "id": payload["id"],
        "model": served_model,
        "choices": [{
            "message": {"role": "assistant", "content": content, "tool_calls": message["tool_calls"]},
            "finish_reason": payload["choices"][0]["finish_reason"],
        }],
        "usage": usage,
    });

    Ok(ModelTurn {
        role: "assistant".to_string(),
        content,
        id: payload["id"].as_str().map(String::from),
        tool_calls,
        images,
        videos,
        full_request,
        full_response,
        model: served_model,
        model_requested: request.model_spec.clone(),
        cost,
        tokens_in,
        tokens_out,
        tokens_reasoning,
        provider,
        duration_ms,
        reasoning_enabled: reasoning.is_some(),
        reasoning_effort: reasoning.as_ref().and_then(|r| r.effort.clone()),
        reasoning_max_tokens: reasoning.as_ref().and_then(|r| r.max_tokens),
    })
}

/// Normalise provider media payloads and deduplicate by URL fingerprint.
///
/// Accepts `{"type": ..., "<kind>": {"url": ...}}`, the bare
/// `{"<kind>": {"url": ...}}` shape, and raw data-URL strings.
fn normalize_media(raw: &Value, kind: &str, data_prefix: &str) -> Vec<Value> {
    let items = match raw.as_array() {
        Some(items) => items,
        None => return Vec::new(),
    };

    let mut seen = std::collections::HashSet::new();
    let mut normalized = Vec::new();

    for item in items {
        let (url, value) = match item {
            Value::Object(_) => {
                let url = item[kind]["url"].as_str().unwrap_or_default().to_string();
                (url, item.clone())
            }
            Value::String(s) if s.starts_with(data_prefix) => {
                (s.clone(), json!({kind: {"url": s}}))
            }
            _ => continue,
        };
        if url.is_empty() {
            continue;
        }

        // Data URLs can be megabytes; fingerprint on the prefix
        let fingerprint: String = if url.starts_with("data:") {
            url.chars().take(200).collect()
        } else {
            url.clone()
        };
        if seen.insert(fingerprint) {
            normalized.push(value);
        }
    }
    normalized
}

/// Convert audio to 16 kHz mono wav via ffmpeg. Returns the original data
/// when ffmpeg is unavailable rather than failing the transcription.
async fn convert_audio_to_wav(audio_base64: &str, source_format: &str) -> Result<(String, String), ModelError> {
    let ffmpeg_available = tokio::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await
        .is_ok();
    if !ffmpeg_available {
        warn!("convert_audio_to_wav: ffmpeg not found, sending original format");
        return Ok((audio_base64.to_string(), source_format.to_string()));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(audio_base64)
        .map_err(|e| ModelError::Transcode(format!("bad audio base64: {e}")))?;

    let dir = std::env::temp_dir();
    let stem = uuid::Uuid::now_v7().to_string();
    let input_path = dir.join(format!("{stem}.{source_format}"));
    let output_path = dir.join(format!("{stem}.wav"));

    tokio::fs::write(&input_path, &bytes)
        .await
        .map_err(|e| ModelError::Transcode(e.to_string()))?;

    let result = tokio::process::Command::new("ffmpeg")
        .args(["-y", "-i"])
        .arg(&input_path)
        .args(["-ar", "16000", "-ac", "1", "-f", "wav"])
        .arg(&output_path)
        .output()
        .await;

    let converted = match result {
        Ok(output) if output.status.success() => {
            let wav = tokio::fs::read(&output_path)
                .await
                .map_err(|e| ModelError::Transcode(e.to_string()))?;
            Ok((
                base64::engine::general_purpose::STANDARD.encode(wav),
                "wav".to_string(),
            ))
        }
        Ok(output) => {
            warn!(stderr = %String::from_utf8_lossy(&output.stderr), "convert_audio_to_wav: ffmpeg failed");
            Ok((audio_base64.to_string(), source_format.to_string()))
        }
        Err(e) => Err(ModelError::Transcode(e.to_string())),
    };

    let _ = tokio::fs::remove_file(&input_path).await;
    let _ = tokio::fs::remove_file(&output_path).await;
    converted
}

fn next_image_index(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0) + 1
}

fn truncate(text: &str, max: usize) -> String {
    let mut end = max.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
