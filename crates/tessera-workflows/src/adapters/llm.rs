//! LLM provider port
//!
//! `complete` retries transient upstream failures (429 and 5xx) with
//! exponential backoff starting at one second. Callers may supply a
//! deterministic cache key; repeated calls with the same key return the
//! cached completion without touching the provider.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::AdapterError;

/// Parameters for a completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    /// Deterministic cache key; identical keys return the cached completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

fn default_max_tokens() -> u32 {
    1024
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            cache_key: None,
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }
}

/// A completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub stop_reason: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, AdapterError>;

    /// Embedding vectors for a batch of texts, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AdapterError>;
}

// =============================================================================
// OpenAI-compatible HTTP provider
// =============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// Chat-completions provider speaking the OpenAI wire format.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
    max_retries: u32,
    cache: RwLock<HashMap<String, Completion>>,
}

impl OpenAiCompatProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            embedding_model: "text-embedding-3-small".to_string(),
            max_retries: 3,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    /// POST with retry on 429/5xx; backoff starts at one second and doubles.
    async fn post_with_retry<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        let mut delay = Duration::from_secs(1);

        for attempt in 0..=self.max_retries {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let transient = status.as_u16() == 429 || status.is_server_error();
                    if !transient {
                        return Err(AdapterError::Permanent(format!(
                            "llm provider returned {status}"
                        )));
                    }
                    if attempt == self.max_retries {
                        return Err(AdapterError::Transient(format!(
                            "llm provider returned {status} after {attempt} retries"
                        )));
                    }
                    warn!(%status, attempt, "llm provider transient error, backing off");
                }
                Err(e) => {
                    if attempt == self.max_retries {
                        return Err(AdapterError::Transient(e.to_string()));
                    }
                    warn!(error = %e, attempt, "llm request failed, backing off");
                }
            }

            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        unreachable!("retry loop returns on final attempt")
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, AdapterError> {
        if let Some(key) = &request.cache_key {
            if let Some(hit) = self.cache.read().get(key) {
                debug!(cache_key = %key, "completion cache hit");
                return Ok(hit.clone());
            }
        }

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self.post_with_retry("/v1/chat/completions", &body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Permanent("llm returned no choices".into()))?;
        let usage = parsed.usage.unwrap_or_default();

        let completion = Completion {
            text: choice.message.content,
            stop_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        };

        if let Some(key) = request.cache_key {
            self.cache.write().insert(key, completion.clone());
        }

        Ok(completion)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AdapterError> {
        let body = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts,
        };

        let response = self.post_with_retry("/v1/embeddings", &body).await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }
}

// =============================================================================
// Fake provider for tests
// =============================================================================

const FAKE_EMBEDDING_DIM: usize = 8;

/// Scripted LLM for tests: queued completions are returned in order; an empty
/// queue echoes the prompt. Embeddings are deterministic functions of the
/// text so similarity is stable across runs.
#[derive(Default)]
pub struct FakeLlm {
    script: Mutex<VecDeque<Result<Completion, AdapterError>>>,
    fail_embeds: std::sync::atomic::AtomicU32,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a completion text.
    pub fn script(&self, text: impl Into<String>) {
        self.script.lock().push_back(Ok(Completion {
            text: text.into(),
            stop_reason: "stop".to_string(),
            input_tokens: 10,
            output_tokens: 10,
        }));
    }

    /// Queue a failure.
    pub fn script_error(&self, error: AdapterError) {
        self.script.lock().push_back(Err(error));
    }

    /// Make the next `n` embed calls fail transiently.
    pub fn fail_next_embeds(&self, n: u32) {
        self.fail_embeds
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    fn deterministic_vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; FAKE_EMBEDDING_DIM];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % FAKE_EMBEDDING_DIM] += byte as f32 / 255.0;
        }
        vector
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, AdapterError> {
        if let Some(scripted) = self.script.lock().pop_front() {
            return scripted;
        }

        Ok(Completion {
            text: request.prompt,
            stop_reason: "stop".to_string(),
            input_tokens: 10,
            output_tokens: 10,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AdapterError> {
        use std::sync::atomic::Ordering;

        let pending = self.fail_embeds.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_embeds
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(AdapterError::Transient("embedding provider unavailable".into()));
        }

        Ok(texts.iter().map(|t| Self::deterministic_vector(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_llm_scripted_order() {
        let llm = FakeLlm::new();
        llm.script("first");
        llm.script("second");

        let a = llm.complete(CompletionRequest::new("p")).await.unwrap();
        let b = llm.complete(CompletionRequest::new("p")).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
    }

    #[tokio::test]
    async fn test_fake_llm_echoes_when_unscripted() {
        let llm = FakeLlm::new();
        let completion = llm
            .complete(CompletionRequest::new("echo me"))
            .await
            .unwrap();
        assert_eq!(completion.text, "echo me");
    }

    #[tokio::test]
    async fn test_fake_llm_scripted_error() {
        let llm = FakeLlm::new();
        llm.script_error(AdapterError::Transient("503".into()));

        assert!(llm.complete(CompletionRequest::new("p")).await.is_err());
    }

    #[tokio::test]
    async fn test_fake_embeddings_deterministic() {
        let llm = FakeLlm::new();
        let texts = vec!["alpha".to_string(), "beta".to_string()];

        let first = llm.embed(&texts).await.unwrap();
        let second = llm.embed(&texts).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].len(), FAKE_EMBEDDING_DIM);
        assert_ne!(first[0], first[1]);
    }
}
