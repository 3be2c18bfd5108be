pub mod stream;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

pub use stream::StreamChunk;

/// Longest prompt the client will send, in characters.
pub const MAX_PROMPT_CHARS: usize = 4000;

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_CONTEXT: u32 = 2048;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Maximum concurrent requests exceeded. Please try again later.")]
    CapacityExceeded,

    #[error("Ollama API error: {status} - {body}")]
    Backend { status: u16, body: String },

    #[error("Invalid response from Ollama")]
    InvalidResponse,

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Unable to reach Ollama server: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A completed, non-streamed generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub model: String,
    pub text: String,
    pub eval_count: Option<u64>,
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, InferenceError>>;

/// Text-completion backend as seen by the story pipeline.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<Generation, InferenceError>;

    async fn generate_stream(&self, prompt: &str, options: GenerateOptions) -> Result<ChunkStream, InferenceError>;

    async fn test_connection(&self) -> bool;

    async fn list_models(&self) -> Result<Vec<String>, InferenceError>;

    fn active_requests(&self) -> usize;

    fn max_concurrent_requests(&self) -> usize;
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: SamplingOptions,
}

#[derive(Serialize)]
struct SamplingOptions {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
    num_ctx: u32,
}

impl SamplingOptions {
    fn from_options(options: &GenerateOptions) -> Self {
        Self {
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            num_ctx: options.max_tokens.unwrap_or(DEFAULT_CONTEXT),
        }
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

/// Client for an Ollama-compatible `/api/generate` server.
pub struct OllamaClient {
    base_url: String,
    default_model: String,
    client: Client,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    // Parent of every in-flight call's token; swapped for a fresh one on cancel_all.
    cancel: Mutex<CancellationToken>,
}

impl OllamaClient {
    pub fn new(base_url: &str, default_model: &str, max_concurrent: usize) -> Self {
        info!("Using Ollama server at: {}", base_url);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
            client: Client::new(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Aborts every in-flight generation, buffered or streaming.
    pub fn cancel_all(&self) {
        let mut parent = self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        parent.cancel();
        *parent = CancellationToken::new();
        warn!("Cancelled all in-flight generations");
    }

    fn child_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .child_token()
    }

    fn acquire(&self) -> Result<OwnedSemaphorePermit, InferenceError> {
        self.permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| InferenceError::CapacityExceeded)
    }

    async fn post_generate(&self, body: &GenerateBody<'_>) -> Result<reqwest::Response, InferenceError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self.client.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Backend { status, body });
        }
        Ok(response)
    }

    async fn generate_buffered(&self, body: &GenerateBody<'_>) -> Result<Generation, InferenceError> {
        let response = self.post_generate(body).await?;
        let json: Value = response.json().await?;
        debug!("Response JSON: {}", json);

        let text = json
            .get("response")
            .and_then(|r| r.as_str())
            .filter(|r| !r.trim().is_empty())
            .ok_or(InferenceError::InvalidResponse)?;

        Ok(Generation {
            model: json
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(body.model)
                .to_string(),
            text: text.to_string(),
            eval_count: json.get("eval_count").and_then(|c| c.as_u64()),
        })
    }
}

fn validate_prompt(prompt: &str) -> Result<&str, InferenceError> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(InferenceError::InvalidInput("Prompt cannot be empty".to_string()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(InferenceError::InvalidInput(format!(
            "Prompt too long. Maximum {} characters allowed.",
            MAX_PROMPT_CHARS
        )));
    }
    Ok(trimmed)
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<Generation, InferenceError> {
        let prompt = validate_prompt(prompt)?;
        // Held until this call returns, on every path.
        let _permit = self.acquire()?;
        let token = self.child_token();

        let model = options.model.as_deref().unwrap_or(&self.default_model);
        let body = GenerateBody {
            model,
            prompt,
            stream: false,
            options: SamplingOptions::from_options(&options),
        };
        info!(
            "Generating with {} (temperature {}, num_ctx {})",
            model, body.options.temperature, body.options.num_ctx
        );
        debug!("Prompt: {}", prompt);

        let result = tokio::select! {
            _ = token.cancelled() => Err(InferenceError::Cancelled),
            result = self.generate_buffered(&body) => result,
        };

        match &result {
            Ok(generation) => info!("Response length: {} characters", generation.text.len()),
            Err(e) => error!("Ollama generation error: {}", e),
        }
        result
    }

    async fn generate_stream(&self, prompt: &str, options: GenerateOptions) -> Result<ChunkStream, InferenceError> {
        let prompt = validate_prompt(prompt)?;
        let permit = self.acquire()?;
        let token = self.child_token();

        let model = options.model.as_deref().unwrap_or(&self.default_model);
        let body = GenerateBody {
            model,
            prompt,
            stream: true,
            options: SamplingOptions::from_options(&options),
        };
        info!("Streaming generation with {}", model);

        let response = tokio::select! {
            _ = token.cancelled() => Err(InferenceError::Cancelled),
            response = self.post_generate(&body) => response,
        }?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(InferenceError::from))
            .boxed();
        Ok(stream::decode_ndjson(bytes, token, Some(permit)))
    }

    async fn test_connection(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                error!("Ollama connection test failed: {}", e);
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Backend { status, body });
        }
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn active_requests(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests;
