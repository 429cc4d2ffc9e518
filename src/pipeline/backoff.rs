//! Process-wide retry gate shared by every judge call.
//!
//! A single slow provider throttles the whole pipeline: every failure pushes
//! `next_allowed_at` out to `now + base + attempt * step`, every success clears
//! it, and every attempt first waits until the gate opens.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    next_allowed_at: Option<Instant>,
}

/// Shared retry-delay state.
#[derive(Debug)]
pub struct RetryGate {
    base: Duration,
    step: Duration,
    state: Mutex<RetryState>,
}

impl RetryGate {
    pub fn new(base: Duration, step: Duration) -> Self {
        Self {
            base,
            step,
            state: Mutex::new(RetryState::default()),
        }
    }

    /// Suspend until the gate allows another attempt.
    pub async fn wait(&self) {
        // Re-check after every sleep: another task may have failed meanwhile.
        while let Some(deadline) = self.next_allowed_at() {
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Record a failure and return the delay now in force.
    pub fn record_failure(&self) -> Duration {
        let mut state = self.lock();
        state.attempt = state.attempt.saturating_add(1);
        let delay = self.base + self.step.saturating_mul(state.attempt);
        state.next_allowed_at = Some(Instant::now() + delay);
        delay
    }

    /// Clear the delay after a successful attempt.
    pub fn record_success(&self) {
        let mut state = self.lock();
        state.attempt = 0;
        state.next_allowed_at = None;
    }

    pub fn attempt(&self) -> u32 {
        self.lock().attempt
    }

    pub fn next_allowed_at(&self) -> Option<Instant> {
        self.lock().next_allowed_at
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetryState> {
        // The state is two plain fields; a panic mid-update cannot leave it torn.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn failure_delay_grows_linearly() {
        let gate = RetryGate::new(Duration::from_secs(20), Duration::from_secs(10));
        assert_eq!(gate.record_failure(), Duration::from_secs(30));
        assert_eq!(gate.record_failure(), Duration::from_secs(40));
        assert_eq!(gate.attempt(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_deadline() {
        let gate = RetryGate::new(Duration::from_secs(20), Duration::from_secs(10));
        let start = Instant::now();
        gate.record_failure();
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_gate() {
        let gate = RetryGate::new(Duration::from_secs(20), Duration::from_secs(10));
        gate.record_failure();
        gate.record_success();
        assert_eq!(gate.attempt(), 0);
        assert!(gate.next_allowed_at().is_none());

        let start = Instant::now();
        gate.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
