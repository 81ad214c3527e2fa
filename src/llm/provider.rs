//! AI provider trait and request/response types
//!
//! A provider is an at-least-once, possibly-slow, possibly-failing text
//! generation call. Providers do no retrying themselves; the step executor
//! owns the retry budget and consults [`LlmError::is_transient`] to decide
//! what is worth retrying.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// One text-generation request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Optional system framing for the model
    pub system: Option<String>,
    /// The rendered step prompt
    pub prompt: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub metadata: HashMap<String, String>,
}

impl CompletionRequest {
    pub fn new<P: Into<String>, M: Into<String>>(prompt: P, model: M) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            model: model.into(),
            max_tokens: None,
            temperature: None,
            metadata: HashMap::new(),
        }
    }
}

/// Provider output for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// Token usage statistics, fed into analytics cost estimation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

/// Reason why generation finished
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// AI provider trait for dependency injection and testing
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g., "openai", "anthropic")
    fn name(&self) -> &str;

    /// Models this provider is known to serve
    fn available_models(&self) -> Vec<String>;

    /// Generate a completion for the given request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Check that the provider is configured and reachable
    async fn health_check(&self) -> Result<(), LlmError>;
}

/// AI provider errors
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Provider server error: {0}")]
    ServerError(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Content filtered by provider: {0}")]
    ContentFiltered(String),
}

impl LlmError {
    /// Whether the executor may retry this failure within its budget.
    /// Structural problems (auth, bad request, malformed or filtered output)
    /// are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_)
                | LlmError::Timeout(_)
                | LlmError::Network(_)
                | LlmError::ServerError(_)
        )
    }
}
