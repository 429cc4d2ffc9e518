//! Telegram bot. Long-polls the Bot API for group messages and carries out
//! moderation actions.
//!
//! Channel ids are `telegram:<chat_id>`; for Telegram the guild id is the same
//! chat id, since mutes and kicks are scoped to the chat.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::error::ChannelError;
use crate::pipeline::types::{InboundEvent, RawElement, native_id};
use crate::platform::{EventStream, ForwardBundle, PlatformBot};

const PLATFORM: &str = "telegram";

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Telegram treats restrictions shorter than this as permanent.
const MIN_RESTRICT_SECS: u64 = 30;

/// Telegram bot backed by the HTTP Bot API.
pub struct TelegramBot {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl TelegramBot {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    /// Call a Bot API method and return its `result`.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(data.get("result").cloned().unwrap_or(Value::Null))
        } else {
            Err(ChannelError::ActionRejected {
                name: PLATFORM.into(),
                action: method.to_string(),
                reason: data
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        }
    }

    /// Send a text message, splitting at Telegram's length limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.call(
                "sendMessage",
                &json!({
                    "chat_id": chat_id,
                    "text": chunk,
                    "disable_web_page_preview": true,
                }),
            )
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: PLATFORM.into(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Start long-polling and yield one event per incoming message.
    pub fn start(&self) -> EventStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram bot listening for messages...");

            loop {
                let body = json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    continue;
                };
                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }
                    let Some(event) = update.get("message").and_then(parse_message) else {
                        continue;
                    };
                    if tx.send(event).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Box::pin(stream)
    }
}

#[async_trait]
impl PlatformBot for TelegramBot {
    fn platform(&self) -> &str {
        PLATFORM
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError> {
        let message_id: i64 = message_id.parse().map_err(|_| ChannelError::InvalidId {
            name: PLATFORM.into(),
            value: message_id.to_string(),
        })?;
        let result = self
            .call(
                "deleteMessage",
                &json!({"chat_id": native_id(channel_id), "message_id": message_id}),
            )
            .await;

        match result {
            Err(ChannelError::ActionRejected { reason, .. })
                if reason.contains("message to delete not found") =>
            {
                tracing::debug!(message_id, "Message already deleted");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn mute(
        &self,
        guild_id: &str,
        user_id: &str,
        duration: Duration,
    ) -> Result<(), ChannelError> {
        let secs = duration.as_secs().max(MIN_RESTRICT_SECS);
        let until = Utc::now().timestamp() + secs as i64;
        self.call(
            "restrictChatMember",
            &json!({
                "chat_id": native_id(guild_id),
                "user_id": parse_user_id(user_id)?,
                "permissions": {
                    "can_send_messages": false,
                    "can_send_audios": false,
                    "can_send_documents": false,
                    "can_send_photos": false,
                    "can_send_videos": false,
                    "can_send_video_notes": false,
                    "can_send_voice_notes": false,
                    "can_send_polls": false,
                    "can_send_other_messages": false,
                    "can_add_web_page_previews": false,
                },
                "until_date": until,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn kick(&self, guild_id: &str, user_id: &str) -> Result<(), ChannelError> {
        let chat_id = native_id(guild_id);
        let user_id = parse_user_id(user_id)?;
        self.call(
            "banChatMember",
            &json!({"chat_id": chat_id, "user_id": user_id}),
        )
        .await?;
        // Lift the ban so the removal is a kick, not a permanent ban.
        self.call(
            "unbanChatMember",
            &json!({"chat_id": chat_id, "user_id": user_id, "only_if_banned": true}),
        )
        .await
        .map(|_| ())
    }

    async fn broadcast(
        &self,
        channel_ids: &[String],
        bundle: &ForwardBundle,
    ) -> Result<(), ChannelError> {
        let text = bundle.render_text();
        let mut last_err = None;
        for channel_id in channel_ids {
            if let Err(e) = self.send_message(native_id(channel_id), &text).await {
                tracing::warn!(channel = %channel_id, error = %e, "Audit forward failed");
                last_err = Some(e);
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        self.call("getMe", &json!({}))
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::StartupFailed {
                name: PLATFORM.into(),
                reason: e.to_string(),
            })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn parse_user_id(user_id: &str) -> Result<i64, ChannelError> {
    user_id.parse().map_err(|_| ChannelError::InvalidId {
        name: PLATFORM.into(),
        value: user_id.to_string(),
    })
}

/// Convert a Bot API `message` object into an inbound event.
fn parse_message(message: &Value) -> Option<InboundEvent> {
    let message_id = message.get("message_id").and_then(Value::as_i64)?;
    let chat = message.get("chat")?;
    let chat_id = chat.get("id").and_then(Value::as_i64)?;
    let from = message.get("from");

    let user_id = from
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();

    let mut elements = Vec::new();
    if let Some(reply) = message.get("reply_to_message") {
        let (reply_user_id, reply_user_name) = sender_identity(reply.get("from"));
        elements.push(
            RawElement::new("quote")
                .with_attr("id", id_string(reply.get("message_id")))
                .with_attr("user_id", reply_user_id)
                .with_attr("user_name", reply_user_name)
                .with_children(body_elements(reply)),
        );
    }

    let body = body_elements(message);
    match message.get("forward_origin") {
        Some(origin) => {
            let (origin_id, origin_name) = origin_identity(origin);
            elements.push(RawElement::new("forward").with_children(vec![
                RawElement::new("message")
                    .with_attr("user_id", origin_id)
                    .with_attr("user_name", origin_name)
                    .with_children(body),
            ]));
        }
        None => elements.extend(body),
    }

    Some(InboundEvent {
        message_id: message_id.to_string(),
        channel_id: format!("{PLATFORM}:{chat_id}"),
        guild_id: chat_id.to_string(),
        user_id,
        user_name: from.and_then(display_name),
        elements,
        is_bot: from
            .and_then(|f| f.get("is_bot"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        is_direct: chat.get("type").and_then(Value::as_str) == Some("private"),
    })
}

/// Text, caption and photo of a message as raw elements.
fn body_elements(message: &Value) -> Vec<RawElement> {
    let mut elements = Vec::new();
    if let Some(photo) = message
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
        .and_then(|p| p.get("file_id"))
        .and_then(Value::as_str)
    {
        // File URLs embed the bot token, so only the opaque file id is exposed.
        elements.push(RawElement::image(format!("telegram-file:{photo}")));
    }
    for key in ["text", "caption"] {
        if let Some(text) = message.get(key).and_then(Value::as_str) {
            elements.push(RawElement::text(text));
        }
    }
    elements
}

fn display_name(user: &Value) -> Option<String> {
    let first = user.get("first_name").and_then(Value::as_str);
    let last = user.get("last_name").and_then(Value::as_str);
    match (first, last) {
        (Some(f), Some(l)) => Some(format!("{f} {l}")),
        (Some(f), None) => Some(f.to_string()),
        _ => user
            .get("username")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

fn sender_identity(from: Option<&Value>) -> (String, String) {
    let id = id_string(from.and_then(|f| f.get("id")));
    let name = from.and_then(display_name).unwrap_or_else(|| id.clone());
    (id, name)
}

fn origin_identity(origin: &Value) -> (String, String) {
    match origin.get("type").and_then(Value::as_str) {
        Some("user") => sender_identity(origin.get("sender_user")),
        Some("hidden_user") => {
            let name = origin
                .get("sender_user_name")
                .and_then(Value::as_str)
                .unwrap_or("hidden")
                .to_string();
            ("hidden".to_string(), name)
        }
        Some("chat") | Some("channel") => {
            let chat = origin.get("sender_chat").or_else(|| origin.get("chat"));
            let id = id_string(chat.and_then(|c| c.get("id")));
            let name = chat
                .and_then(|c| c.get("title"))
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| id.clone());
            (id, name)
        }
        _ => ("unknown".to_string(), "unknown".to_string()),
    }
}

fn id_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => "unknown".to_string(),
    }
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut cut = max_len;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(cut);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
