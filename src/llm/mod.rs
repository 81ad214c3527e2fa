//! AI provider abstraction layer
//!
//! Provider-agnostic interface for the single external AI call a pipeline
//! step makes, with concrete OpenAI and Anthropic backends.

pub mod provider;
pub mod providers;

pub use provider::*;
pub use providers::*;
