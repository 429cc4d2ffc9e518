//! Coerce a free-text judge reply into violation records.
//!
//! The model does not reliably emit bare JSON, so candidates are tried in a
//! fixed order and the first one that parses *and* has the expected shape wins:
//!
//! 1. the body of a fenced code block labelled `json`
//! 2. the span between the first and last bracket of a container (`[`…`]`, then `{`…`}`)
//! 3. the raw reply
//!
//! Accepted shapes are a top-level array of record objects, or an object whose
//! `violations` (or `results`/`records`) key holds such an array.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::pipeline::types::{ActionMagnitude, ViolationRecord};

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```json[ \t]*\r?\n?(.*?)```").expect("fenced json pattern is valid")
});

/// Keys under which an object-shaped reply may carry its record list.
const LIST_KEYS: &[&str] = &["violations", "results", "records"];

/// Extraction strategies, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    FencedJson,
    BracketSpan,
    Raw,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [Self::FencedJson, Self::BracketSpan, Self::Raw];

    fn candidates(self, reply: &str) -> Vec<&str> {
        match self {
            Self::FencedJson => FENCED_JSON
                .captures_iter(reply)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().trim())
                .collect(),
            Self::BracketSpan => [('[', ']'), ('{', '}')]
                .into_iter()
                .filter_map(|(open, close)| span(reply, open, close))
                .collect(),
            Self::Raw => vec![reply.trim()],
        }
    }
}

/// Extract violation records from a judge reply.
///
/// Returns `None` when no candidate yields the expected shape; an empty list
/// means the judge found nothing.
pub fn extract_violations(reply: &str) -> Option<Vec<ViolationRecord>> {
    for strategy in Strategy::ORDER {
        for candidate in strategy.candidates(reply) {
            if candidate.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(candidate) else {
                continue;
            };
            if let Some(items) = record_list(&value) {
                debug!(?strategy, count = items.len(), "Judge reply parsed");
                return Some(items.iter().filter_map(decode_record).collect());
            }
        }
    }
    None
}

fn span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// The record array, if `value` has one of the accepted shapes.
fn record_list(value: &Value) -> Option<&Vec<Value>> {
    let list = match value {
        Value::Array(items) => items,
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(Value::as_array)?,
        _ => return None,
    };
    list.iter().all(Value::is_object).then_some(list)
}

// ── Record decoding ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Text(String),
    Number(i64),
}

impl IdValue {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdField {
    One(IdValue),
    Many(Vec<IdValue>),
}

impl IdField {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(id) => vec![id.into_string()],
            Self::Many(ids) => ids.into_iter().map(IdValue::into_string).collect(),
        }
    }
}

/// Mute seconds as a JSON number or a numeric string (`60`, `"60"`, `"-1"`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SecondsValue {
    Number(f64),
    Text(String),
}

impl SecondsValue {
    /// Whole seconds, or `None` when the value is not a finite number.
    fn whole_seconds(&self) -> Option<i64> {
        let secs = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        secs.is_finite().then(|| secs.round() as i64)
    }
}

/// One record as the judge writes it.
#[derive(Debug, Deserialize)]
struct WireViolation {
    #[serde(default, alias = "message_id", alias = "messageId")]
    id: Option<IdField>,
    #[serde(default, alias = "message_ids", alias = "messageIds")]
    ids: Option<IdField>,
    #[serde(default, alias = "userId", alias = "user")]
    user_id: Option<IdValue>,
    #[serde(default)]
    reason: Option<String>,
    /// Signed seconds: positive mutes, negative removes.
    #[serde(default)]
    mute: Option<SecondsValue>,
    #[serde(default)]
    kick: Option<Value>,
}

fn decode_record(item: &Value) -> Option<ViolationRecord> {
    let wire: WireViolation = match serde_json::from_value(item.clone()) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, record = %item, "Skipping malformed violation record");
            return None;
        }
    };

    let mut ids: Vec<String> = wire
        .id
        .into_iter()
        .chain(wire.ids)
        .flat_map(IdField::into_vec)
        .filter(|id| !id.trim().is_empty())
        .collect();
    ids.dedup();
    if ids.is_empty() {
        debug!(record = %item, "Skipping violation record without message ids");
        return None;
    }

    let kick = match wire.kick {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    };
    let mute_seconds = wire.mute.and_then(|mute| {
        let secs = mute.whole_seconds();
        if secs.is_none() {
            warn!(record = %item, "Unreadable mute value, flagging only");
        }
        secs
    });

    Some(ViolationRecord {
        subject_user_id: wire.user_id.map(IdValue::into_string),
        source_message_ids: ids,
        reason: wire
            .reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "unspecified".to_string()),
        magnitude: ActionMagnitude::from_signed(mute_seconds, kick),
    })
}
