//! Shared types for the moderation pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Inbound event ───────────────────────────────────────────────────

/// One node of the host's message element tree.
///
/// Hosts describe rich content as nested elements (`text`, `img`, `forward`,
/// `message`, `quote`, ...). The normalizer turns this tree into `Segment`s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawElement {
    pub kind: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<RawElement>,
}

impl RawElement {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new("text").with_attr("content", content)
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::new("img").with_attr("src", url)
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_children(mut self, children: Vec<RawElement>) -> Self {
        self.children = children;
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

/// A chat event as delivered by the host's message hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub message_id: String,
    /// Platform-qualified channel id, e.g. `telegram:-1001234`.
    pub channel_id: String,
    pub guild_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub elements: Vec<RawElement>,
    pub is_bot: bool,
    pub is_direct: bool,
}

impl InboundEvent {
    /// Platform prefix of the channel id.
    pub fn platform(&self) -> &str {
        platform_of(&self.channel_id)
    }
}

/// Platform prefix of a qualified channel id (`"telegram:-100"` → `"telegram"`).
pub fn platform_of(channel_id: &str) -> &str {
    channel_id
        .split_once(':')
        .map_or(channel_id, |(platform, _)| platform)
}

/// Native part of a qualified channel id (`"telegram:-100"` → `"-100"`).
pub fn native_id(channel_id: &str) -> &str {
    channel_id.split_once(':').map_or(channel_id, |(_, id)| id)
}

// ── Normalized message ──────────────────────────────────────────────

/// One content segment of a normalized message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    Image { url: String },
    Forward { messages: Vec<Message> },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }
}

/// A normalized chat message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub guild_id: String,
    pub user_id: String,
    pub user_name: String,
    pub content: Vec<Segment>,
    /// Flattened rendering used for audit text.
    pub plain_text: String,
    /// Ingestion time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn platform(&self) -> &str {
        platform_of(&self.channel_id)
    }

    /// Batch-unique key. Native message ids only repeat across channels, so
    /// `{channel_id}/{id}` is what the judge sees as the message id.
    pub fn key(&self) -> String {
        format!("{}/{}", self.channel_id, self.id)
    }
}

/// Render segments as plain text. Non-text segments become placeholders.
pub fn render_plain(segments: &[Segment]) -> String {
    let mut parts = Vec::with_capacity(segments.len());
    for segment in segments {
        match segment {
            Segment::Text { text } => parts.push(text.clone()),
            Segment::Image { .. } => parts.push("[image]".to_string()),
            Segment::Forward { .. } => parts.push("[forward]".to_string()),
        }
    }
    parts.join(" ")
}

// ── Batch ───────────────────────────────────────────────────────────

/// An ordered, detached set of messages submitted for one judgment.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub messages: Vec<Message>,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            messages,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ── Violation ───────────────────────────────────────────────────────

/// What a violation asks the dispatcher to do to its subject.
///
/// Mute and removal are distinct variants, so a record can never select both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMagnitude {
    /// Flag only: recall/forward still apply, nothing punitive.
    FlagOnly,
    Mute(Duration),
    Remove,
}

impl ActionMagnitude {
    /// Decode the judge's signed mute value and removal flag.
    ///
    /// Positive seconds mute, negative seconds or `kick = true` remove,
    /// zero or absent flag only.
    pub fn from_signed(mute_seconds: Option<i64>, kick: bool) -> Self {
        match mute_seconds {
            _ if kick => Self::Remove,
            Some(s) if s < 0 => Self::Remove,
            Some(s) if s > 0 => Self::Mute(Duration::from_secs(s as u64)),
            _ => Self::FlagOnly,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::FlagOnly => "flag",
            Self::Mute(_) => "mute",
            Self::Remove => "kick",
        }
    }
}

/// A structured judgment for one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecord {
    pub subject_user_id: Option<String>,
    pub source_message_ids: Vec<String>,
    pub reason: String,
    pub magnitude: ActionMagnitude,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_prefix_split() {
        assert_eq!(platform_of("telegram:-1001"), "telegram");
        assert_eq!(native_id("telegram:-1001"), "-1001");
        assert_eq!(platform_of("discord:guild:chan"), "discord");
        assert_eq!(native_id("discord:guild:chan"), "guild:chan");
        assert_eq!(platform_of("bare"), "bare");
    }

    #[test]
    fn magnitude_sign_selects_single_action() {
        assert_eq!(
            ActionMagnitude::from_signed(Some(60), false),
            ActionMagnitude::Mute(Duration::from_secs(60))
        );
        assert_eq!(ActionMagnitude::from_signed(Some(-1), false), ActionMagnitude::Remove);
        assert_eq!(ActionMagnitude::from_signed(Some(60), true), ActionMagnitude::Remove);
        assert_eq!(ActionMagnitude::from_signed(Some(0), false), ActionMagnitude::FlagOnly);
        assert_eq!(ActionMagnitude::from_signed(None, false), ActionMagnitude::FlagOnly);
    }

    #[test]
    fn magnitude_labels() {
        assert_eq!(ActionMagnitude::FlagOnly.label(), "flag");
        assert_eq!(ActionMagnitude::Mute(Duration::from_secs(1)).label(), "mute");
        assert_eq!(ActionMagnitude::Remove.label(), "kick");
    }

    #[test]
    fn segment_serializes_tagged() {
        let json = serde_json::to_value(Segment::Image {
            url: "https://x/img.png".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["url"], "https://x/img.png");
    }

    #[test]
    fn render_plain_uses_placeholders() {
        let segments = vec![
            Segment::text("look"),
            Segment::Image { url: "u".into() },
            Segment::Forward { messages: vec![] },
        ];
        assert_eq!(render_plain(&segments), "look [image] [forward]");
    }

    #[test]
    fn raw_element_builders() {
        let el = RawElement::new("forward").with_children(vec![RawElement::text("hi")]);
        assert_eq!(el.children[0].attr("content"), Some("hi"));
        assert_eq!(RawElement::image("u").attr("src"), Some("u"));
    }
}
