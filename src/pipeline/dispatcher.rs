//! Dispatcher. Applies violation records to the platform.
//!
//! Best effort throughout: an unresolvable record, a missing bot or a failed
//! capability call is logged and skipped, never propagated. Actions run in a
//! fixed order (mute, kick, recall, forward) and each one is isolated from the
//! others. The audit transcript for the whole batch goes out as one bundle.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::config::{Action, ActionSet, ModerationConfig};
use crate::pipeline::types::{ActionMagnitude, Batch, Message, Segment, ViolationRecord, platform_of};
use crate::platform::{AuditEntry, BotRegistry, ForwardBundle};

/// Counters from one `apply` call, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub applied: usize,
    pub unresolved: usize,
    pub no_bot: usize,
    pub failed_actions: usize,
}

/// Batch positions by message key, plus bare native ids that occur once.
struct MessageIndex {
    by_key: HashMap<String, usize>,
    /// `None` marks a native id shared by messages from different channels.
    by_native: HashMap<String, Option<usize>>,
}

impl MessageIndex {
    fn new(batch: &Batch) -> Self {
        let mut by_key = HashMap::with_capacity(batch.len());
        let mut by_native: HashMap<String, Option<usize>> = HashMap::with_capacity(batch.len());
        for (i, message) in batch.messages.iter().enumerate() {
            by_key.insert(message.key(), i);
            by_native
                .entry(message.id.clone())
                .and_modify(|slot| *slot = None)
                .or_insert(Some(i));
        }
        Self { by_key, by_native }
    }

    fn resolve(&self, id: &str) -> Option<usize> {
        if let Some(&i) = self.by_key.get(id) {
            return Some(i);
        }
        match self.by_native.get(id) {
            Some(Some(i)) => Some(*i),
            Some(None) => {
                warn!(id, "Ambiguous message id matches several channels, ignoring");
                None
            }
            None => None,
        }
    }
}

/// A record whose ids resolved inside the batch.
struct Resolved<'a> {
    record: ViolationRecord,
    /// Resolved messages in batch (arrival) order.
    messages: Vec<&'a Message>,
    /// Batch position of the earliest resolved message.
    position: usize,
}

pub struct Dispatcher {
    bots: BotRegistry,
    actions: ActionSet,
    forward_targets: Vec<String>,
    forward_raw: bool,
}

impl Dispatcher {
    pub fn new(bots: BotRegistry, config: &ModerationConfig) -> Self {
        Self {
            bots,
            actions: config.actions.clone(),
            forward_targets: config.forward_targets.clone(),
            forward_raw: config.forward_raw,
        }
    }

    /// Apply `violations` judged from `batch`.
    pub async fn apply(&self, violations: Vec<ViolationRecord>, batch: &Batch) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let index = MessageIndex::new(batch);

        let mut resolved = Vec::with_capacity(violations.len());
        for record in violations {
            let mut hits: Vec<usize> = record
                .source_message_ids
                .iter()
                .filter_map(|id| index.resolve(id))
                .collect();
            if hits.is_empty() {
                debug!(
                    batch_id = %batch.id,
                    ids = ?record.source_message_ids,
                    "Dropping violation with no resolvable message"
                );
                summary.unresolved += 1;
                continue;
            }
            hits.sort_unstable();
            hits.dedup();
            resolved.push(Resolved {
                position: hits[0],
                messages: hits.iter().map(|&i| &batch.messages[i]).collect(),
                record,
            });
        }

        // Arrival order equals timestamp order; position breaks timestamp ties.
        resolved.sort_by_key(|r| (r.messages[0].timestamp, r.position));

        let mut bundle = ForwardBundle::default();
        for violation in &resolved {
            match self.apply_one(violation, &mut bundle).await {
                Some(failed) => {
                    summary.applied += 1;
                    summary.failed_actions += failed;
                }
                None => summary.no_bot += 1,
            }
        }

        if !bundle.is_empty() {
            summary.failed_actions += self.send_bundle(&bundle).await;
        }

        info!(
            batch_id = %batch.id,
            applied = summary.applied,
            unresolved = summary.unresolved,
            no_bot = summary.no_bot,
            failed_actions = summary.failed_actions,
            "Dispatch complete"
        );
        summary
    }

    /// Run the enabled actions for one violation. Returns the number of failed
    /// actions, or `None` when no bot serves the message's platform.
    async fn apply_one(&self, violation: &Resolved<'_>, bundle: &mut ForwardBundle) -> Option<usize> {
        let primary = violation.messages[0];
        let record = &violation.record;
        let Some(bot) = self.bots.for_channel(&primary.channel_id) else {
            warn!(
                channel = %primary.channel_id,
                message_id = %primary.id,
                "No bot for platform, skipping violation"
            );
            return None;
        };

        let subject = primary.user_id.as_str();
        if let Some(claimed) = record.subject_user_id.as_deref()
            && claimed != subject
        {
            debug!(claimed, subject, "Judge named a different subject; acting on the message author");
        }

        let mut failed = 0;

        match record.magnitude {
            ActionMagnitude::Mute(duration) if self.actions.contains(Action::Mute) => {
                if let Err(e) = bot.mute(&primary.guild_id, subject, duration).await {
                    warn!(user_id = subject, error = %e, "Mute failed");
                    failed += 1;
                } else {
                    info!(user_id = subject, secs = duration.as_secs(), reason = %record.reason, "Muted user");
                }
            }
            ActionMagnitude::Remove if self.actions.contains(Action::Kick) => {
                if let Err(e) = bot.kick(&primary.guild_id, subject).await {
                    warn!(user_id = subject, error = %e, "Kick failed");
                    failed += 1;
                } else {
                    info!(user_id = subject, reason = %record.reason, "Removed user");
                }
            }
            _ => {}
        }

        if self.actions.contains(Action::Recall) {
            for message in &violation.messages {
                let Some(owner) = self.bots.for_channel(&message.channel_id) else {
                    warn!(channel = %message.channel_id, "No bot to recall message");
                    failed += 1;
                    continue;
                };
                if let Err(e) = owner.delete_message(&message.channel_id, &message.id).await {
                    warn!(message_id = %message.id, error = %e, "Recall failed");
                    failed += 1;
                }
            }
        }

        if self.actions.contains(Action::Forward) {
            self.append_audit(bundle, violation);
        }

        Some(failed)
    }

    fn append_audit(&self, bundle: &mut ForwardBundle, violation: &Resolved<'_>) {
        let primary = violation.messages[0];
        bundle.push(AuditEntry::Header {
            timestamp: primary.timestamp,
            user_id: primary.user_id.clone(),
            user_name: primary.user_name.clone(),
            reason: violation.record.reason.clone(),
            action: violation.record.magnitude.label(),
        });
        for message in &violation.messages {
            bundle.push(AuditEntry::Content {
                user_name: message.user_name.clone(),
                segments: message.content.clone(),
            });
            if self.forward_raw
                && let Some(text) = raw_rendering(&message.content)
            {
                bundle.push(AuditEntry::Raw { text });
            }
        }
    }

    /// Send the bundle to every target, grouped by platform. Returns failures.
    async fn send_bundle(&self, bundle: &ForwardBundle) -> usize {
        if self.forward_targets.is_empty() {
            debug!("Audit bundle built but no forward target configured");
            return 0;
        }

        let mut by_platform: HashMap<&str, Vec<String>> = HashMap::new();
        for target in &self.forward_targets {
            by_platform
                .entry(platform_of(target))
                .or_default()
                .push(target.clone());
        }

        let mut failed = 0;
        for (platform, targets) in by_platform {
            let Some(bot) = self.bots.for_channel(&targets[0]) else {
                warn!(platform, "No bot for forward target platform");
                failed += 1;
                continue;
            };
            if let Err(e) = bot.broadcast(&targets, bundle).await {
                warn!(platform, error = %e, "Audit forward failed");
                failed += 1;
            }
        }
        failed
    }
}

/// JSON rendering of every non-text segment, if there are any.
fn raw_rendering(segments: &[Segment]) -> Option<String> {
    let raw: Vec<String> = segments
        .iter()
        .filter(|s| !s.is_text())
        .filter_map(|s| serde_json::to_string(s).ok())
        .collect();
    (!raw.is_empty()).then(|| raw.join(" "))
}
