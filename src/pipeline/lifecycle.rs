//! Moderation service. The host-facing entry point.
//!
//! Filters inbound events, normalizes the survivors and feeds them to the
//! accumulator. `shutdown` drains everything still pending or in flight.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ModerationConfig;
use crate::pipeline::accumulator::{Accumulator, BatchHandler};
use crate::pipeline::normalizer::normalize;
use crate::pipeline::types::InboundEvent;

/// Why an event was not moderated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Direct,
    Bot,
    Whitelisted,
    ForwardTarget,
}

pub struct ModerationService {
    config: ModerationConfig,
    accumulator: Accumulator,
}

impl ModerationService {
    pub fn new(config: ModerationConfig, handler: Arc<dyn BatchHandler>) -> Self {
        let accumulator = Accumulator::new(&config, handler);
        info!(
            max_batch_size = config.max_batch_size,
            inactivity_secs = config.inactivity_timeout.as_secs(),
            max_wait_secs = config.max_batch_wait.as_secs(),
            whitelist = config.whitelist.len(),
            forward_targets = config.forward_targets.len(),
            "Moderation service started"
        );
        Self {
            config,
            accumulator,
        }
    }

    /// Why `event` should be ignored, if it should.
    pub fn skip_reason(&self, event: &InboundEvent) -> Option<Skip> {
        if event.is_direct {
            Some(Skip::Direct)
        } else if event.is_bot {
            Some(Skip::Bot)
        } else if self.config.is_whitelisted(&event.user_id) {
            Some(Skip::Whitelisted)
        } else if self.config.is_forward_target(&event.channel_id) {
            Some(Skip::ForwardTarget)
        } else {
            None
        }
    }

    /// Handle one inbound chat event. Returns whether it was queued.
    pub fn on_event(&self, event: InboundEvent) -> bool {
        if let Some(reason) = self.skip_reason(&event) {
            debug!(message_id = %event.message_id, ?reason, "Skipping event");
            return false;
        }
        let message = normalize(&event);
        if message.content.is_empty() {
            debug!(message_id = %message.id, "Skipping event with no content");
            return false;
        }
        self.accumulator.offer(message);
        true
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    /// Flush pending messages and wait for in-flight batches, bounded by the
    /// configured grace period.
    pub async fn shutdown(&self) {
        info!(pending = self.accumulator.pending_len(), "Shutting down moderation");
        match self.config.shutdown_grace {
            Some(grace) => {
                if tokio::time::timeout(grace, self.accumulator.drain()).await.is_err() {
                    warn!(
                        grace_secs = grace.as_secs(),
                        "Shutdown grace elapsed with batches still in flight"
                    );
                }
            }
            None => self.accumulator.drain().await,
        }
    }
}
