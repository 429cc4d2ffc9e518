//! LLM integration.
//!
//! The judge talks to any OpenAI-compatible chat-completions endpoint through
//! the `LlmProvider` trait, so tests can swap in a scripted provider.

pub mod openai_compat;
pub mod provider;

pub use openai_compat::OpenAiCompatProvider;
pub use provider::*;

use std::sync::Arc;

use crate::config::JudgeConfig;
use crate::error::LlmError;

/// Create an LLM provider from configuration.
pub fn create_provider(config: &JudgeConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiCompatProvider::new(
        &config.endpoint,
        config.api_key.clone(),
        &config.model,
        config.request_timeout,
    )?;
    tracing::info!(endpoint = %config.endpoint, "Using judge model {}", config.model);
    Ok(Arc::new(provider))
}
