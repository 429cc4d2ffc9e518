//! Batch accumulator. Groups incoming messages into judge batches.
//!
//! A pending batch is released by whichever comes first:
//!
//! - **size**: `max_batch_size` messages are pending; the oldest N go at once
//! - **inactivity**: no new message for `inactivity_timeout`
//! - **max wait**: the oldest pending message has waited `max_batch_wait`
//!
//! Released batches run on their own tokio task, so a slow judge never blocks
//! intake. Every accepted message ends up in exactly one batch.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ModerationConfig;
use crate::pipeline::types::{Batch, Message};

/// Consumer of released batches.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: Batch);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Inactivity,
    MaxWait,
}

struct Timer {
    token: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

struct Pending {
    arrived: Instant,
    message: Message,
}

#[derive(Default)]
struct State {
    pending: Vec<Pending>,
    inactivity: Option<Timer>,
    max_wait: Option<Timer>,
    next_token: u64,
    in_flight: Vec<JoinHandle<()>>,
    closed: bool,
}

impl State {
    fn timer_mut(&mut self, kind: TimerKind) -> &mut Option<Timer> {
        match kind {
            TimerKind::Inactivity => &mut self.inactivity,
            TimerKind::MaxWait => &mut self.max_wait,
        }
    }

    fn cancel_timers(&mut self) {
        for timer in [self.inactivity.take(), self.max_wait.take()].into_iter().flatten() {
            timer.handle.abort();
        }
    }
}

struct Inner {
    max_batch_size: usize,
    inactivity_timeout: Duration,
    max_batch_wait: Duration,
    handler: Arc<dyn BatchHandler>,
    state: Mutex<State>,
}

/// Cheap to clone; clones share one pending batch.
#[derive(Clone)]
pub struct Accumulator {
    inner: Arc<Inner>,
}

impl Accumulator {
    pub fn new(config: &ModerationConfig, handler: Arc<dyn BatchHandler>) -> Self {
        Self::with_limits(
            config.max_batch_size,
            config.inactivity_timeout,
            config.max_batch_wait,
            handler,
        )
    }

    pub fn with_limits(
        max_batch_size: usize,
        inactivity_timeout: Duration,
        max_batch_wait: Duration,
        handler: Arc<dyn BatchHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_batch_size: max_batch_size.max(1),
                inactivity_timeout,
                max_batch_wait,
                handler,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Add one message. Must be called from inside a tokio runtime.
    pub fn offer(&self, message: Message) {
        self.offer_all(std::iter::once(message));
    }

    /// Add several messages arriving at the same instant, in order.
    pub fn offer_all(&self, messages: impl IntoIterator<Item = Message>) {
        let now = Instant::now();
        let mut state = self.inner.lock();
        if state.closed {
            warn!("Accumulator is drained, dropping offered messages");
            return;
        }

        let before = state.pending.len();
        state
            .pending
            .extend(messages.into_iter().map(|message| Pending { arrived: now, message }));
        if state.pending.len() == before {
            return;
        }

        let mut sliced = false;
        while state.pending.len() >= self.inner.max_batch_size {
            let rest = state.pending.split_off(self.inner.max_batch_size);
            let full = std::mem::replace(&mut state.pending, rest);
            debug!(size = full.len(), "Batch full, releasing");
            self.inner.submit(&mut state, full);
            sliced = true;
        }

        let Some(max_deadline) = self.inner.oldest_deadline(&state) else {
            state.cancel_timers();
            return;
        };
        // The oldest message may already be past its deadline if the timer
        // task has not been scheduled yet.
        if max_deadline <= now {
            debug!("Max wait already elapsed, flushing on arrival");
            state.cancel_timers();
            self.inner.flush_all(&mut state);
            return;
        }
        if sliced || state.max_wait.is_none() {
            self.arm(&mut state, TimerKind::MaxWait, max_deadline);
        }
        self.arm(&mut state, TimerKind::Inactivity, now + self.inner.inactivity_timeout);
    }

    /// Release the pending batch and wait for every batch still being handled.
    ///
    /// Later offers are dropped.
    pub async fn drain(&self) {
        let in_flight = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.cancel_timers();
            self.inner.flush_all(&mut state);
            std::mem::take(&mut state.in_flight)
        };

        info!(batches = in_flight.len(), "Draining in-flight batches");
        for handle in in_flight {
            if let Err(e) = handle.await {
                warn!(error = %e, "Batch task ended abnormally");
            }
        }
    }

    /// Messages waiting for release.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Released batches whose handler has not finished.
    pub fn in_flight(&self) -> usize {
        let mut state = self.inner.lock();
        state.in_flight.retain(|h| !h.is_finished());
        state.in_flight.len()
    }

    fn arm(&self, state: &mut State, kind: TimerKind, deadline: Instant) {
        if let Some(timer) = state.timer_mut(kind).as_ref()
            && timer.deadline == deadline
        {
            return;
        }
        if let Some(old) = state.timer_mut(kind).take() {
            old.handle.abort();
        }

        state.next_token += 1;
        let token = state.next_token;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(kind, token);
            }
        });
        *state.timer_mut(kind) = Some(Timer {
            token,
            deadline,
            handle,
        });
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn oldest_deadline(&self, state: &State) -> Option<Instant> {
        state.pending.first().map(|p| p.arrived + self.max_batch_wait)
    }

    fn fire(&self, kind: TimerKind, token: u64) {
        let mut state = self.lock();
        // A re-armed or cancelled timer leaves a different token behind.
        if state.timer_mut(kind).as_ref().map(|t| t.token) != Some(token) {
            return;
        }
        // This is the running task; dropping its handle detaches it.
        state.timer_mut(kind).take();
        state.cancel_timers();
        debug!(trigger = ?kind, pending = state.pending.len(), "Timer released batch");
        self.flush_all(&mut state);
    }

    fn flush_all(&self, state: &mut State) {
        let pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            self.submit(state, pending);
        }
    }

    fn submit(&self, state: &mut State, pending: Vec<Pending>) {
        let batch = Batch::new(pending.into_iter().map(|p| p.message).collect());
        info!(batch_id = %batch.id, size = batch.len(), "Releasing batch");

        let handler = Arc::clone(&self.handler);
        state.in_flight.retain(|h| !h.is_finished());
        state
            .in_flight
            .push(tokio::spawn(async move { handler.handle(batch).await }));
    }
}
