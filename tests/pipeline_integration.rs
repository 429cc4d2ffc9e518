//! End-to-end: inbound events, batching, judge and platform actions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use batch_moderator::config::{ActionSet, ModerationConfig};
use batch_moderator::error::{ChannelError, LlmError};
use batch_moderator::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};
use batch_moderator::pipeline::types::{InboundEvent, RawElement};
use batch_moderator::pipeline::{
    BatchProcessor, Dispatcher, JudgeClient, ModerationService, RetryGate,
};
use batch_moderator::platform::{AuditEntry, BotRegistry, ForwardBundle, PlatformBot};

/// Flags every message whose text contains "buy", muting for 120s. Fails the
/// first call to exercise the retry path.
struct KeywordJudge {
    calls: Mutex<usize>,
}

#[async_trait]
impl LlmProvider for KeywordJudge {
    fn model_name(&self) -> &str {
        "keyword"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls == 1
        };
        if first {
            return Err(LlmError::RequestFailed {
                provider: "keyword".into(),
                reason: "503".into(),
            });
        }

        let user_turn = &request.messages[1].content;
        let batch: serde_json::Value = serde_json::from_str(user_turn).unwrap();
        let flagged: Vec<serde_json::Value> = batch
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| m["content"][0]["text"].as_str().unwrap_or("").contains("buy"))
            .map(|m| serde_json::json!({"id": m["id"], "user_id": m["userId"], "reason": "advertising", "mute": 120}))
            .collect();

        Ok(CompletionResponse {
            content: format!("Findings:\n```json\n{}\n```", serde_json::Value::Array(flagged)),
            input_tokens: 100,
            output_tokens: 20,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Delete(String),
    Mute(String, u64),
    Kick(String),
    Broadcast(Vec<String>, ForwardBundle),
}

#[derive(Default)]
struct RecordingBot {
    calls: Mutex<Vec<Call>>,
}

#[async_trait]
impl PlatformBot for RecordingBot {
    fn platform(&self) -> &str {
        "telegram"
    }
    async fn delete_message(&self, _: &str, message_id: &str) -> Result<(), ChannelError> {
        self.calls.lock().unwrap().push(Call::Delete(message_id.into()));
        Ok(())
    }
    async fn mute(&self, _: &str, user_id: &str, d: Duration) -> Result<(), ChannelError> {
        self.calls.lock().unwrap().push(Call::Mute(user_id.into(), d.as_secs()));
        Ok(())
    }
    async fn kick(&self, _: &str, user_id: &str) -> Result<(), ChannelError> {
        self.calls.lock().unwrap().push(Call::Kick(user_id.into()));
        Ok(())
    }
    async fn broadcast(&self, targets: &[String], bundle: &ForwardBundle) -> Result<(), ChannelError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Broadcast(targets.to_vec(), bundle.clone()));
        Ok(())
    }
}

fn event(id: &str, user: &str, text: &str) -> InboundEvent {
    InboundEvent {
        message_id: id.into(),
        channel_id: "telegram:-100".into(),
        guild_id: "-100".into(),
        user_id: user.into(),
        user_name: Some(format!("user {user}")),
        elements: vec![RawElement::text(text)],
        is_bot: false,
        is_direct: false,
    }
}

fn build(bot: Arc<RecordingBot>, llm: Arc<KeywordJudge>) -> ModerationService {
    let config = ModerationConfig {
        max_batch_size: 3,
        inactivity_timeout: Duration::from_secs(60),
        max_batch_wait: Duration::from_secs(300),
        whitelist: vec!["admin".into()],
        actions: ActionSet::all(),
        forward_targets: vec!["telegram:-999".into()],
        ..ModerationConfig::default()
    };

    let mut bots = BotRegistry::new();
    bots.register(bot);
    let gate = Arc::new(RetryGate::new(Duration::from_secs(20), Duration::from_secs(10)));
    let judge = JudgeClient::new(llm, "No advertising.", gate, Duration::from_secs(30));
    let processor = Arc::new(BatchProcessor::new(judge, Dispatcher::new(bots, &config)));
    ModerationService::new(config, processor)
}

#[tokio::test(start_paused = true)]
async fn flagged_messages_are_muted_recalled_and_forwarded() {
    let bot = Arc::new(RecordingBot::default());
    let llm = Arc::new(KeywordJudge { calls: Mutex::new(0) });
    let service = build(Arc::clone(&bot), Arc::clone(&llm));

    service.on_event(event("1", "alice", "hello all"));
    service.on_event(event("2", "admin", "buy the admin course"));
    service.on_event(event("3", "bob", "buy cheap coins"));
    service.on_event(event("4", "carol", "nice weather"));

    service.shutdown().await;

    assert_eq!(*llm.calls.lock().unwrap(), 2);
    let calls = bot.calls.lock().unwrap().clone();
    assert_eq!(calls[0], Call::Mute("bob".into(), 120));
    assert_eq!(calls[1], Call::Delete("3".into()));
    let Call::Broadcast(targets, bundle) = &calls[2] else {
        panic!("expected the audit forward, got {calls:?}");
    };
    assert_eq!(targets, &vec!["telegram:-999".to_string()]);
    assert!(matches!(
        &bundle.entries[0],
        AuditEntry::Header { user_id, reason, action: "mute", .. } if user_id == "bob" && reason == "advertising"
    ));
    assert!(bundle.render_text().contains("buy cheap coins"));
    assert_eq!(calls.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn quiet_chat_flushes_after_inactivity() {
    let bot = Arc::new(RecordingBot::default());
    let llm = Arc::new(KeywordJudge { calls: Mutex::new(0) });
    let service = build(Arc::clone(&bot), Arc::clone(&llm));

    service.on_event(event("10", "dave", "buy now"));
    assert_eq!(service.accumulator().pending_len(), 1);

    // Inactivity (60s) releases the batch; the first judge call fails and the
    // retry opens 30s later.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(service.accumulator().pending_len(), 0);
    tokio::time::sleep(Duration::from_secs(40)).await;

    let calls = bot.calls.lock().unwrap().clone();
    assert!(calls.contains(&Call::Mute("dave".into(), 120)));
    assert!(calls.contains(&Call::Delete("10".into())));
    drop(calls);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shared_message_id_across_groups_hits_only_the_offender() {
    let bot = Arc::new(RecordingBot::default());
    let llm = Arc::new(KeywordJudge { calls: Mutex::new(0) });
    let service = build(Arc::clone(&bot), Arc::clone(&llm));

    service.on_event(event("42", "spammer", "buy followers"));
    let mut other_group = event("42", "innocent", "good morning");
    other_group.channel_id = "telegram:-200".into();
    other_group.guild_id = "-200".into();
    service.on_event(other_group);

    service.shutdown().await;

    let calls = bot.calls.lock().unwrap().clone();
    assert_eq!(calls[0], Call::Mute("spammer".into(), 120));
    assert_eq!(calls[1], Call::Delete("42".into()));
    assert!(!calls.contains(&Call::Mute("innocent".into(), 120)));
    assert_eq!(calls.len(), 3);
}
