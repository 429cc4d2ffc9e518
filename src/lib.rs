//! Batch moderator. LLM-judged streaming chat moderation.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod platform;
