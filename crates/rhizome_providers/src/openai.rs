//! OpenAI-compatible HTTP providers.
//!
//! Works against any endpoint speaking the chat-completions and embeddings
//! wire shapes, which covers the hosted service and the usual local
//! stand-ins.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use rhizome_protocol::parse_extraction;

use crate::embedder::{Embedder, EmbeddingConfig};
use crate::error::ProviderError;
use crate::extractor::{ExtractRequest, ExtractionOutcome, Extractor, TokenUsage};
use crate::prompt::{build_user_prompt, EXTRACTION_SYSTEM_PROMPT};
use crate::rate_limit::TokenBucket;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub normalize_embeddings: bool,
    pub request_timeout: Duration,
    pub requests_per_sec: f64,
}

impl OpenAiConfig {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        Some(Self {
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key,
            embedding_model: std::env::var("RHIZOME_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            embedding_dimension: 1536,
            normalize_embeddings: false,
            request_timeout: rhizome_protocol::config::defaults::EXTRACTOR_TIMEOUT,
            requests_per_sec: 2.0,
        })
    }
}

// ----------------------------------------------------------------------
// Wire shapes
// ----------------------------------------------------------------------

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

// ----------------------------------------------------------------------
// Error mapping
// ----------------------------------------------------------------------

fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Transient(format!("request timed out: {err}"))
    } else if err.is_connect() {
        ProviderError::Transient(format!("connection failed: {err}"))
    } else {
        ProviderError::Transient(err.to_string())
    }
}

fn map_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited {
            message: truncate(body, 200),
            retry_after,
        };
    }
    if status.is_server_error() {
        return ProviderError::Transient(format!("{status}: {}", truncate(body, 200)));
    }
    ProviderError::Permanent(format!("{status}: {}", truncate(body, 200)))
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ----------------------------------------------------------------------
// Extractor
// ----------------------------------------------------------------------

pub struct OpenAiExtractor {
    client: reqwest::Client,
    config: OpenAiConfig,
    throttle: Arc<TokenBucket>,
}

impl OpenAiExtractor {
    pub fn new(config: OpenAiConfig, throttle: Arc<TokenBucket>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Permanent(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config,
            throttle,
        })
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(
        &self,
        request: ExtractRequest<'_>,
    ) -> Result<ExtractionOutcome, ProviderError> {
        self.throttle.acquire().await;

        let user_prompt =
            build_user_prompt(request.chunk_text, request.context, request.strict_reminder);
        let body = json!({
            "model": request.profile.model,
            "temperature": request.profile.temperature,
            "top_p": request.profile.top_p,
            "response_format": { "type": "json_object" },
            "messages": [
                ChatMessage { role: "system", content: EXTRACTION_SYSTEM_PROMPT },
                ChatMessage { role: "user", content: &user_prompt },
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body, retry_after));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("malformed chat response: {e}")))?;
        let content = payload
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ProviderError::Transient("empty choices in chat response".into()))?;

        debug!(model = %request.profile.model, bytes = content.len(), "Extraction response received");
        let result =
            parse_extraction(content).map_err(|e| ProviderError::InvalidOutput(e.to_string()))?;

        let usage = payload
            .usage
            .map(|u| TokenUsage {
                input: u.prompt_tokens,
                output: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ExtractionOutcome { result, usage })
    }

    fn provider_id(&self) -> (String, String) {
        ("openai".to_string(), self.config.embedding_model.clone())
    }
}

// ----------------------------------------------------------------------
// Embedder
// ----------------------------------------------------------------------

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    config: OpenAiConfig,
    throttle: Arc<TokenBucket>,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig, throttle: Arc<TokenBucket>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(rhizome_protocol::config::defaults::EMBEDDER_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Permanent(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config,
            throttle,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.throttle.acquire().await;

        let response = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.embedding_model,
                "input": texts,
            }))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body, retry_after));
        }

        let payload: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("malformed embeddings response: {e}")))?;

        if payload.data.len() != texts.len() {
            return Err(ProviderError::Transient(format!(
                "embeddings count mismatch: sent {}, got {}",
                texts.len(),
                payload.data.len()
            )));
        }

        let mut vectors = Vec::with_capacity(payload.data.len());
        for row in payload.data {
            if row.embedding.len() != self.config.embedding_dimension {
                return Err(ProviderError::Permanent(format!(
                    "embedding dimension {} does not match configured {}",
                    row.embedding.len(),
                    self.config.embedding_dimension
                )));
            }
            vectors.push(if self.config.normalize_embeddings {
                l2_normalize(row.embedding)
            } else {
                row.embedding
            });
        }
        Ok(vectors)
    }

    fn active_config(&self) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "openai".to_string(),
            model: self.config.embedding_model.clone(),
            dimension: self.config.embedding_dimension,
            normalize: self.config.normalize_embeddings,
        }
    }
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
