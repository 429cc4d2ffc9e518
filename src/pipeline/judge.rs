//! Judge client. Batch in, violation records out.
//!
//! `analyze` never fails. Transport errors, timeouts, empty replies and
//! replies without a usable record list all count as failures: the shared
//! `RetryGate` is pushed out and the same batch is tried again once it opens.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::backoff::RetryGate;
use crate::pipeline::extract::extract_violations;
use crate::pipeline::types::{Batch, Message, Segment, ViolationRecord};

/// Low temperature keeps the judge's output format stable.
const JUDGE_TEMPERATURE: f32 = 0.1;

/// Batch-level content moderation judge.
pub struct JudgeClient {
    llm: Arc<dyn LlmProvider>,
    rules: String,
    gate: Arc<RetryGate>,
    attempt_timeout: Duration,
}

impl JudgeClient {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        rules: impl Into<String>,
        gate: Arc<RetryGate>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            rules: rules.into(),
            gate,
            attempt_timeout,
        }
    }

    /// Judge a batch, retrying until a usable reply arrives.
    pub async fn analyze(&self, batch: &Batch) -> Vec<ViolationRecord> {
        if batch.is_empty() {
            return Vec::new();
        }

        let request = self.build_request(batch);
        loop {
            self.gate.wait().await;

            match self.attempt(request.clone()).await {
                Ok(records) => {
                    self.gate.record_success();
                    info!(
                        batch_id = %batch.id,
                        messages = batch.len(),
                        violations = records.len(),
                        "Batch judged"
                    );
                    return records;
                }
                Err(e) => {
                    let delay = self.gate.record_failure();
                    warn!(
                        batch_id = %batch.id,
                        error = %e,
                        attempt = self.gate.attempt(),
                        retry_in_secs = delay.as_secs(),
                        "Judge attempt failed, will retry"
                    );
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: CompletionRequest,
    ) -> Result<Vec<ViolationRecord>, PipelineError> {
        let response = tokio::time::timeout(self.attempt_timeout, self.llm.complete(request))
            .await
            .map_err(|_| crate::error::LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout: self.attempt_timeout,
            })??;

        let reply = response.content.trim();
        if reply.is_empty() {
            return Err(PipelineError::EmptyReply);
        }
        debug!(
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Judge replied"
        );

        extract_violations(reply).ok_or_else(|| {
            warn!(raw_response = %reply, "Judge reply had no usable violation list");
            PipelineError::UnparsableReply
        })
    }

    fn build_request(&self, batch: &Batch) -> CompletionRequest {
        CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(&self.rules)),
            ChatMessage::user(build_user_prompt(batch)),
        ])
        .with_temperature(JUDGE_TEMPERATURE)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the judge system prompt around the operator's rule text.
pub fn build_system_prompt(rules: &str) -> String {
    let mut prompt = String::from(
        "You are a group chat moderator. You receive a JSON array of chat messages and \
         decide which of them break the rules below.\n\n\
         Input: an array of objects {\"id\", \"guildId\", \"userId\", \"userName\", \"content\"}. \
         `content` is an array of parts: {\"type\":\"text\",\"text\"}, {\"type\":\"image\",\"url\"} \
         or {\"type\":\"forward\",\"messages\":[...]} where forwarded messages have the same shape.\n\n\
         Output: ONLY a JSON array, no prose and no markdown. One object per violation:\n\
         {\"ids\": [\"<message id>\", ...], \"user_id\": \"<author id>\", \"reason\": \"<short reason>\", \"mute\": <seconds>}\n\
         - `ids` lists every message id that belongs to the violation, copied exactly as given.\n\
         - `mute` > 0 mutes the author for that many seconds, `mute` < 0 removes the author \
         from the group, `mute` = 0 only flags the messages.\n\
         - Return [] when nothing breaks the rules.\n\n\
         Rules:\n",
    );
    prompt.push_str(rules);
    prompt
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage<'a> {
    id: String,
    guild_id: &'a str,
    user_id: &'a str,
    user_name: &'a str,
    content: Vec<WireSegment<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireSegment<'a> {
    Text { text: &'a str },
    Image { url: &'a str },
    Forward { messages: Vec<WireMessage<'a>> },
}

fn wire_message(message: &Message) -> WireMessage<'_> {
    WireMessage {
        id: message.key(),
        guild_id: &message.guild_id,
        user_id: &message.user_id,
        user_name: &message.user_name,
        content: message.content.iter().map(wire_segment).collect(),
    }
}

fn wire_segment(segment: &Segment) -> WireSegment<'_> {
    match segment {
        Segment::Text { text } => WireSegment::Text { text },
        Segment::Image { url } => WireSegment::Image { url },
        Segment::Forward { messages } => WireSegment::Forward {
            messages: messages.iter().map(wire_message).collect(),
        },
    }
}

/// Serialize a batch into the judge's user turn.
pub fn build_user_prompt(batch: &Batch) -> String {
    let wire: Vec<WireMessage<'_>> = batch.messages.iter().map(wire_message).collect();
    // Serializing borrowed strings and tagged enums cannot fail.
    serde_json::to_string(&wire).unwrap_or_else(|_| "[]".to_string())
}
