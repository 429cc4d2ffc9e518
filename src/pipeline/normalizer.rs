//! Message normalizer. Turns the host element tree into a `Message`.
//!
//! Pure transform. Text-like elements are buffered and coalesced; the buffer is
//! flushed (trimmed, empties dropped) whenever an image or forward boundary is
//! hit. Unknown element kinds are dropped so one odd element cannot block the
//! rest of the message.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::pipeline::types::{InboundEvent, Message, RawElement, Segment, render_plain};

/// Inline formatting wrappers whose children are plain content.
const INLINE_CONTAINERS: &[&str] = &["p", "span", "b", "strong", "i", "em", "u", "s", "del", "code", "a", "sup", "sub"];

/// Normalize an inbound event, stamping it with the current time.
pub fn normalize(event: &InboundEvent) -> Message {
    normalize_at(event, Utc::now())
}

/// Normalize an inbound event with an explicit ingestion time.
pub fn normalize_at(event: &InboundEvent, received_at: DateTime<Utc>) -> Message {
    let origin = Origin {
        channel_id: &event.channel_id,
        guild_id: &event.guild_id,
        received_at,
    };
    build_message(
        &origin,
        event.message_id.clone(),
        event.user_id.clone(),
        event.user_name.clone(),
        &event.elements,
    )
}

/// Fields a nested node inherits from the top-level event.
struct Origin<'a> {
    channel_id: &'a str,
    guild_id: &'a str,
    received_at: DateTime<Utc>,
}

fn build_message(
    origin: &Origin<'_>,
    id: String,
    user_id: String,
    user_name: Option<String>,
    elements: &[RawElement],
) -> Message {
    let content = segments(origin, elements);
    let plain_text = render_plain(&content);
    let user_name = user_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| user_id.clone());

    Message {
        id,
        channel_id: origin.channel_id.to_string(),
        guild_id: origin.guild_id.to_string(),
        user_id,
        user_name,
        content,
        plain_text,
        timestamp: origin.received_at,
    }
}

fn segments(origin: &Origin<'_>, elements: &[RawElement]) -> Vec<Segment> {
    let mut builder = SegmentBuilder::default();
    walk(origin, elements, &mut builder);
    builder.finish()
}

#[derive(Default)]
struct SegmentBuilder {
    out: Vec<Segment>,
    text: String,
}

impl SegmentBuilder {
    fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    fn flush(&mut self) {
        let trimmed = self.text.trim();
        if !trimmed.is_empty() {
            self.out.push(Segment::text(trimmed));
        }
        self.text.clear();
    }

    fn push_segment(&mut self, segment: Segment) {
        self.flush();
        self.out.push(segment);
    }

    fn finish(mut self) -> Vec<Segment> {
        self.flush();
        self.out
    }
}

fn walk(origin: &Origin<'_>, elements: &[RawElement], builder: &mut SegmentBuilder) {
    for element in elements {
        match element.kind.as_str() {
            "text" => builder.push_text(element.attr("content").unwrap_or_default()),
            "at" => {
                let name = element
                    .attr("name")
                    .or_else(|| element.attr("id"))
                    .unwrap_or_default();
                builder.push_text(&format!("@{name}"));
            }
            "br" => builder.push_text("\n"),
            "img" | "image" => {
                match element.attr("src").or_else(|| element.attr("url")) {
                    Some(url) => builder.push_segment(Segment::Image {
                        url: url.to_string(),
                    }),
                    None => debug!("Dropping image element without a source"),
                }
            }
            "forward" => {
                let messages = element
                    .children
                    .iter()
                    .filter(|child| child.kind == "message")
                    .enumerate()
                    .map(|(i, node)| node_message(origin, node, i))
                    .collect();
                builder.push_segment(Segment::Forward { messages });
            }
            "quote" => {
                let node = node_message(origin, element, 0);
                builder.push_segment(Segment::Forward {
                    messages: vec![node],
                });
            }
            kind if INLINE_CONTAINERS.contains(&kind) => walk(origin, &element.children, builder),
            other => debug!(kind = %other, "Dropping unsupported element"),
        }
    }
}

/// Build a nested message from a `message`/`quote` node.
fn node_message(origin: &Origin<'_>, node: &RawElement, index: usize) -> Message {
    let id = node
        .attr("id")
        .map(String::from)
        .unwrap_or_else(|| format!("node-{index}"));
    let user_id = node.attr("user_id").unwrap_or("unknown").to_string();
    let user_name = node.attr("user_name").map(String::from);
    build_message(origin, id, user_id, user_name, &node.children)
}
