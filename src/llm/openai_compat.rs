//! OpenAI-compatible `/chat/completions` client over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};

const PROVIDER: &str = "openai-compatible";

/// Talks to any endpoint that speaks the OpenAI chat-completions protocol.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            timeout,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    fn payload(&self, request: &CompletionRequest) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": request.messages,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        payload
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = self.url();
        tracing::debug!(url = %url, model = %self.model, "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.payload(&request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: PROVIDER.to_string(),
                        timeout: self.timeout,
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: PROVIDER.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            });
        }

        let body = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("status {status}: {}", truncate(&body, 300)),
            });
        }

        let data: Value = serde_json::from_str(&body)?;
        parse_completion(&data)
    }
}

/// Pull `choices[0].message.content` and usage out of a completion body.
fn parse_completion(data: &Value) -> Result<CompletionResponse, LlmError> {
    if let Some(error) = data.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("API error: {message}"),
        });
    }

    let choice = data
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "response has no choices".to_string(),
        })?;

    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "choice has no message content".to_string(),
        })?
        .to_string();

    let usage = data.get("usage");
    let tokens = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };

    Ok(CompletionResponse {
        content,
        input_tokens: tokens("prompt_tokens"),
        output_tokens: tokens("completion_tokens"),
        finish_reason: FinishReason::from_wire(
            choice.get("finish_reason").and_then(Value::as_str),
        ),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(
            "http://localhost:9999/v1/",
            SecretString::from("sk-test"),
            "judge-model",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn url_appends_chat_completions() {
        assert_eq!(provider().url(), "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn payload_carries_model_and_messages() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("rules"),
            ChatMessage::user("[]"),
        ])
        .with_temperature(0.0);
        let payload = provider().payload(&request);
        assert_eq!(payload["model"], "judge-model");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "[]");
        assert_eq!(payload["temperature"], 0.0);
    }

    #[test]
    fn parse_completion_reads_first_choice() {
        let data = json!({
            "choices": [{"message": {"role": "assistant", "content": "[]"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let response = parse_completion(&data).unwrap();
        assert_eq!(response.content, "[]");
        assert_eq!(response.input_tokens, 12);
        assert_eq!(response.output_tokens, 3);
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn parse_completion_surfaces_api_error() {
        let data = json!({"error": {"message": "quota exceeded"}});
        let err = parse_completion(&data).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn parse_completion_rejects_missing_choices() {
        let err = parse_completion(&json!({"choices": []})).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 100), "short");
    }
}
