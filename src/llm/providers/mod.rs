//! Concrete AI provider implementations

pub mod anthropic;
pub mod openai;

pub use anthropic::*;
pub use openai::*;

use crate::config::LlmSection;
use crate::llm::provider::{LlmError, LlmProvider};
use std::sync::Arc;
use std::time::Duration;

/// Build a provider from the configured backend name
pub fn create_provider(
    llm: &LlmSection,
    api_key: String,
    timeout: Duration,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match llm.provider.as_str() {
        "openai" => {
            let config = OpenAiConfig {
                api_key,
                timeout,
                ..Default::default()
            };
            Ok(Arc::new(OpenAiProvider::new(config)?))
        }
        "anthropic" => {
            let config = AnthropicConfig {
                api_key,
                timeout,
                ..Default::default()
            };
            Ok(Arc::new(AnthropicProvider::new(config)?))
        }
        other => Err(LlmError::NotConfigured(format!(
            "Unknown provider '{other}'"
        ))),
    }
}
