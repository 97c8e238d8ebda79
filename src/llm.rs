//! SQL generation
//!
//! Remote model call with a bounded retry, backed by an offline fallback that
//! always produces a candidate.

use crate::error::{ErrorKind, Result, TeleSqlError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Remote,
    Fallback,
}

/// Raw text from generation. Never executed directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub text: String,
    pub provenance: Provenance,
    pub generated_at: DateTime<Utc>,
}

impl SqlCandidate {
    fn new(text: String, provenance: Provenance) -> Self {
        Self {
            text,
            provenance,
            generated_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("no remote model configured")]
    NotConfigured,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("authentication rejected (HTTP {0})")]
    Authentication(u16),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Worth one more attempt before falling back
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::Transport(_)
            | ProviderError::RateLimited
            | ProviderError::Malformed(_) => true,
            ProviderError::Upstream { status, .. } => *status >= 500,
            ProviderError::NotConfigured | ProviderError::Authentication(_) => false,
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ProviderError::Timeout(_) => ErrorKind::GenerationTimeout,
            _ => ErrorKind::GenerationProviderError,
        }
    }
}

/// Remote model: prompt in, completion text out.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> std::result::Result<String, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible endpoints (Groq, OpenAI).
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    request_timeout: Duration,
}

impl OpenAiCompatibleProvider {
    pub fn new(api_key: String, model: String, base_url: String, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TeleSqlError::Llm(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            request_timeout,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> std::result::Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "Return a single PostgreSQL SELECT statement only, no text."},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.0,
            "max_tokens": 800,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.request_timeout)
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            401 | 403 => return Err(ProviderError::Authentication(status)),
            429 => return Err(ProviderError::RateLimited),
            _ => {
                let message = response.text().await.unwrap_or_default();
                return Err(ProviderError::Upstream {
                    status,
                    message: message.chars().take(200).collect(),
                });
            }
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        completion_text(parsed)
    }
}

fn completion_text(parsed: ChatResponse) -> std::result::Result<String, ProviderError> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Malformed("no choices in response".to_string()))?;

    if choice.finish_reason.as_deref() == Some("length") {
        warn!("LLM response was truncated due to length limit");
    }

    match choice.message.content {
        Some(content) if !content.trim().is_empty() => Ok(content),
        _ => Err(ProviderError::Malformed("empty completion".to_string())),
    }
}

/// Offline generator used whenever the remote model is unavailable.
///
/// Produces an inert statement that passes validation and returns a single
/// `message` row, so the rest of the pipeline sees the usual input shape.
#[derive(Debug, Clone, Default)]
pub struct OfflineFallback;

impl OfflineFallback {
    pub const PLACEHOLDER_SQL: &'static str = "SELECT 'LLM offline - cannot generate SQL for this \
question right now. Please try again later or contact the admin.' AS message";

    pub fn generate(&self, prompt: &str) -> String {
        let truncated: String = prompt.chars().take(120).collect::<String>().replace('\n', " ");
        warn!(
            "Using fallback SQL generator (remote LLM unavailable). Prompt (truncated): {}",
            truncated
        );
        Self::PLACEHOLDER_SQL.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    AwaitingRemote,
    Fallback,
}

/// What generation produced, keeping a recovered failure visible even though
/// the caller always gets a candidate.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Remote(SqlCandidate),
    Recovered {
        candidate: SqlCandidate,
        cause: ProviderError,
    },
}

impl GenerationOutcome {
    pub fn candidate(&self) -> &SqlCandidate {
        match self {
            GenerationOutcome::Remote(candidate) => candidate,
            GenerationOutcome::Recovered { candidate, .. } => candidate,
        }
    }

    pub fn into_candidate(self) -> SqlCandidate {
        match self {
            GenerationOutcome::Remote(candidate) => candidate,
            GenerationOutcome::Recovered { candidate, .. } => candidate,
        }
    }

    pub fn recovered_from(&self) -> Option<ErrorKind> {
        match self {
            GenerationOutcome::Remote(_) => None,
            GenerationOutcome::Recovered { cause, .. } => Some(cause.error_kind()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationPolicy {
    /// Bound on each remote call
    pub attempt_timeout: Duration,
    /// Remote attempts before falling back, clamped to 1..=2
    pub max_remote_attempts: u8,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(20),
            max_remote_attempts: 2,
        }
    }
}

impl GenerationPolicy {
    fn attempts(&self) -> u8 {
        self.max_remote_attempts.clamp(1, 2)
    }

    /// Upper bound on the time spent waiting for the remote model
    pub fn total_budget(&self) -> Duration {
        self.attempt_timeout * u32::from(self.attempts())
    }
}

pub struct GenerationClient {
    provider: Option<Arc<dyn CompletionProvider>>,
    fallback: OfflineFallback,
    policy: GenerationPolicy,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, policy: GenerationPolicy) -> Self {
        Self {
            provider: Some(provider),
            fallback: OfflineFallback,
            policy,
        }
    }

    /// Client with no remote model; every request is served by the fallback.
    pub fn offline(policy: GenerationPolicy) -> Self {
        Self {
            provider: None,
            fallback: OfflineFallback,
            policy,
        }
    }

    pub fn policy(&self) -> &GenerationPolicy {
        &self.policy
    }

    /// Produce a candidate for the prompt. Provider failures never escape:
    /// they end in the fallback candidate with the cause attached.
    pub async fn generate(&self, prompt: &str) -> GenerationOutcome {
        let mut state = GenerationState::Idle;
        debug!(?state, prompt_chars = prompt.len(), "Starting SQL generation");

        let cause = match &self.provider {
            None => ProviderError::NotConfigured,
            Some(provider) => {
                let max_attempts = self.policy.attempts();
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    state = GenerationState::AwaitingRemote;
                    debug!(?state, attempt, provider = provider.name(), "Requesting SQL from remote model");

                    let error = match self.request_remote(provider.as_ref(), prompt).await {
                        Ok(text) => {
                            info!(attempt, provider = provider.name(), "Generated SQL candidate from remote model");
                            return GenerationOutcome::Remote(SqlCandidate::new(text, Provenance::Remote));
                        }
                        Err(e) => e,
                    };

                    warn!(attempt, error = %error, "Remote SQL generation failed");
                    if attempt >= max_attempts || !error.is_transient() {
                        break error;
                    }
                }
            }
        };

        state = GenerationState::Fallback;
        warn!(?state, cause = %cause, "Falling back to offline SQL generator");
        GenerationOutcome::Recovered {
            candidate: SqlCandidate::new(self.fallback.generate(prompt), Provenance::Fallback),
            cause,
        }
    }

    async fn request_remote(
        &self,
        provider: &dyn CompletionProvider,
        prompt: &str,
    ) -> std::result::Result<String, ProviderError> {
        match tokio::time::timeout(self.policy.attempt_timeout, provider.complete(prompt)).await {
            Ok(Ok(text)) if text.trim().is_empty() => {
                Err(ProviderError::Malformed("empty completion".to_string()))
            }
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.policy.attempt_timeout)),
        }
    }
}
