//! Error types for the moderation pipeline.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a platform bot while carrying out a capability call.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Platform {name} rejected {action}: {reason}")]
    ActionRejected {
        name: String,
        action: String,
        reason: String,
    },

    #[error("Invalid identifier for channel {name}: {value}")]
    InvalidId { name: String, value: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a single judge attempt produced no usable verdict.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Judge returned an empty reply")]
    EmptyReply,

    #[error("Judge reply did not contain a usable violation list")]
    UnparsableReply,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}
