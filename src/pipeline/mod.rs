//! Moderation pipeline.
//!
//! Every group message from any platform flows through:
//! 1. `lifecycle::ModerationService::on_event`: filtering
//! 2. `normalizer::normalize`: host elements to segments
//! 3. `accumulator::Accumulator`: size, inactivity and max-wait batching
//! 4. `judge::JudgeClient::analyze`: one LLM call per batch, retried behind a shared gate
//! 5. `dispatcher::Dispatcher::apply`: mute, kick, recall, then one audit forward

pub mod accumulator;
pub mod backoff;
pub mod dispatcher;
pub mod extract;
pub mod judge;
pub mod lifecycle;
pub mod normalizer;
pub mod processor;
pub mod types;

pub use accumulator::{Accumulator, BatchHandler};
pub use backoff::RetryGate;
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use judge::JudgeClient;
pub use lifecycle::ModerationService;
pub use processor::BatchProcessor;
