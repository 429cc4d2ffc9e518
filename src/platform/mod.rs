//! Platform bots. The moderation capabilities the host exposes per platform.

pub mod telegram;

pub use telegram::TelegramBot;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;
use crate::pipeline::types::{InboundEvent, Segment, platform_of};

/// Stream of inbound chat events from a platform.
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Capabilities the dispatcher calls on a platform.
///
/// Channel ids are passed fully qualified (`platform:id`); implementations
/// strip their own prefix.
#[async_trait]
pub trait PlatformBot: Send + Sync {
    /// Platform prefix this bot serves, e.g. `"telegram"`.
    fn platform(&self) -> &str;

    /// Delete a message. Already-deleted messages should not be an error.
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChannelError>;

    async fn mute(&self, guild_id: &str, user_id: &str, duration: Duration)
    -> Result<(), ChannelError>;

    async fn kick(&self, guild_id: &str, user_id: &str) -> Result<(), ChannelError>;

    /// Send one bundled audit forward to each target channel.
    async fn broadcast(&self, channel_ids: &[String], bundle: &ForwardBundle)
    -> Result<(), ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Bots keyed by platform prefix.
#[derive(Default, Clone)]
pub struct BotRegistry {
    bots: HashMap<String, Arc<dyn PlatformBot>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, bot: Arc<dyn PlatformBot>) {
        let platform = bot.platform().to_string();
        if self.bots.insert(platform.clone(), bot).is_some() {
            tracing::warn!(platform = %platform, "Replacing previously registered bot");
        }
    }

    /// The bot serving the platform prefix of `channel_id`.
    pub fn for_channel(&self, channel_id: &str) -> Option<&Arc<dyn PlatformBot>> {
        self.bots.get(platform_of(channel_id))
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn PlatformBot>> {
        self.bots.values()
    }
}

// ── Audit forward payload ───────────────────────────────────────────

/// One part of an audit transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEntry {
    /// Who was flagged, when, and why.
    Header {
        timestamp: DateTime<Utc>,
        user_id: String,
        user_name: String,
        reason: String,
        action: &'static str,
    },
    /// Original content of a flagged message.
    Content {
        user_name: String,
        segments: Vec<Segment>,
    },
    /// Diagnostic rendering of non-text segments.
    Raw { text: String },
}

/// Bundled transcript sent once per dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardBundle {
    pub entries: Vec<AuditEntry>,
}

impl ForwardBundle {
    pub fn push(&mut self, entry: AuditEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain-text rendering for platforms without native forward cards.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry {
                AuditEntry::Header {
                    timestamp,
                    user_id,
                    user_name,
                    reason,
                    action,
                } => {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(&format!(
                        "[{}] {} ({}): {} [{}]\n",
                        timestamp.format("%Y-%m-%d %H:%M:%S"),
                        user_name,
                        user_id,
                        reason,
                        action
                    ));
                }
                AuditEntry::Content {
                    user_name,
                    segments,
                } => {
                    render_segments(&mut out, user_name, segments, 1);
                }
                AuditEntry::Raw { text } => {
                    out.push_str("  raw: ");
                    out.push_str(text);
                    out.push('\n');
                }
            }
        }
        out
    }
}

fn render_segments(out: &mut String, user_name: &str, segments: &[Segment], depth: usize) {
    let indent = "  ".repeat(depth);
    out.push_str(&format!("{indent}{user_name}: "));
    let mut first = true;
    for segment in segments {
        match segment {
            Segment::Text { text } => {
                if !first {
                    out.push(' ');
                }
                out.push_str(text);
            }
            Segment::Image { url } => {
                if !first {
                    out.push(' ');
                }
                out.push_str(&format!("[image: {url}]"));
            }
            Segment::Forward { messages } => {
                out.push_str("[forward]\n");
                for message in messages {
                    render_segments(out, &message.user_name, &message.content, depth + 1);
                }
                out.push_str(&indent);
            }
        }
        first = false;
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Message;

    struct NullBot(&'static str);

    #[async_trait]
    impl PlatformBot for NullBot {
        fn platform(&self) -> &str {
            self.0
        }
        async fn delete_message(&self, _: &str, _: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn mute(&self, _: &str, _: &str, _: Duration) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn kick(&self, _: &str, _: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn broadcast(&self, _: &[String], _: &ForwardBundle) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[test]
    fn registry_resolves_by_prefix() {
        let mut registry = BotRegistry::new();
        registry.register(Arc::new(NullBot("telegram")));
        registry.register(Arc::new(NullBot("discord")));

        assert_eq!(registry.all().count(), 2);
        assert_eq!(
            registry.for_channel("telegram:-100").map(|b| b.platform()),
            Some("telegram")
        );
        assert!(registry.for_channel("matrix:!room").is_none());
    }

    #[test]
    fn bundle_renders_header_content_and_nested_forward() {
        let nested = Message {
            id: "n1".into(),
            channel_id: "telegram:-1".into(),
            guild_id: "-1".into(),
            user_id: "9".into(),
            user_name: "bob".into(),
            content: vec![Segment::text("quoted")],
            plain_text: "quoted".into(),
            timestamp: Utc::now(),
        };
        let mut bundle = ForwardBundle::default();
        bundle.push(AuditEntry::Header {
            timestamp: Utc::now(),
            user_id: "42".into(),
            user_name: "alice".into(),
            reason: "spam".into(),
            action: "mute",
        });
        bundle.push(AuditEntry::Content {
            user_name: "alice".into(),
            segments: vec![
                Segment::text("buy"),
                Segment::Image { url: "https://i/1".into() },
                Segment::Forward { messages: vec![nested] },
            ],
        });
        bundle.push(AuditEntry::Raw {
            text: "img=https://i/1".into(),
        });

        let text = bundle.render_text();
        assert!(text.contains("alice (42): spam [mute]"));
        assert!(text.contains("alice: buy [image: https://i/1]"));
        assert!(text.contains("    bob: quoted"));
        assert!(text.contains("raw: img=https://i/1"));
    }
}
