//! Retry classification and backoff
//!
//! The backoff window grows with the number of consecutive failed sends:
//!
//! | Consecutive failures | Delay before the next timer-driven send |
//! |----------------------|-----------------------------------------|
//! | 1 | `slot_delay` (10s) |
//! | n > 1 | random in `1..=slot_delay * (2^n - 1) / 2`, clamped to `[slot_delay, max_delay]` |
//!
//! A `Retry-After` value returned by the endpoint raises the window to at
//! least that duration, up to `max_delay`. Any success resets the counter to
//! zero.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Default base delay unit for retries
pub const DEFAULT_SLOT_DELAY: Duration = Duration::from_secs(10);

/// Default upper bound for the backoff window
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Hard ceiling on any backoff window, whatever the policy says
pub const MAX_BACKOFF_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

/// Statuses that put the items back into the pending set
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Statuses counted as throttling by the statistics counter
pub fn is_throttle_status(status: u16) -> bool {
    matches!(status, 402 | 429 | 439)
}

/// Computes backoff windows
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub slot_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            slot_delay: DEFAULT_SLOT_DELAY,
            max_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(slot_delay: Duration, max_delay: Duration) -> Self {
        Self {
            slot_delay,
            max_delay: max_delay.max(slot_delay),
        }
    }

    /// Delay to wait after `consecutive_failures` failed sends
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures <= 1 {
            return self.slot_delay;
        }

        let exponent = consecutive_failures.min(32);
        let backoff_slot = ((1u64 << exponent) - 1) as f64 / 2.0;
        let slot_ms = self.slot_delay.as_millis() as f64;
        let upper = (backoff_slot * slot_ms).max(1.0);
        let jittered = rand::rng().random_range(0.0..upper).floor() as u64 + 1;

        Duration::from_millis(jittered)
            .min(self.max_delay)
            .max(self.slot_delay)
    }
}

/// Consecutive-failure counter and the instant before which timer-driven
/// sends are suppressed
#[derive(Debug, Default)]
pub struct BackoffState {
    consecutive_failures: u32,
    retry_at: Option<Instant>,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Record a failed send and return the new backoff window
    pub fn record_failure(&mut self, policy: &RetryPolicy, retry_after: Option<Duration>) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let mut delay = policy.delay_for(self.consecutive_failures);
        if let Some(retry_after) = retry_after {
            delay = delay.max(retry_after.min(policy.max_delay));
        }
        let delay = delay.min(MAX_BACKOFF_WINDOW);

        let now = Instant::now();
        self.retry_at = Some(now.checked_add(delay).unwrap_or(now + DEFAULT_MAX_RETRY_DELAY));
        delay
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.retry_at = None;
    }

    /// Whether a timer-driven send must be skipped at `now`
    pub fn is_suppressed(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| now < at)
    }

    /// Time left in the current window
    pub fn remaining(&self, now: Instant) -> Duration {
        self.retry_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_waits_one_slot() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(0), Duration::from_secs(10));
    }

    #[test]
    fn delay_stays_within_bounds() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(60));
        for failures in 2..40 {
            let delay = policy.delay_for(failures);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(60));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_window() {
        let policy = RetryPolicy::default();
        let mut state = BackoffState::new();

        state.record_failure(&policy, None);
        state.record_failure(&policy, None);
        assert_eq!(state.consecutive_failures(), 2);
        assert!(state.is_suppressed(Instant::now()));

        state.record_success();
        assert_eq!(state.consecutive_failures(), 0);
        assert!(!state.is_suppressed(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_extends_window() {
        let policy = RetryPolicy::default();
        let mut state = BackoffState::new();

        let delay = state.record_failure(&policy, Some(Duration::from_secs(120)));
        assert_eq!(delay, Duration::from_secs(120));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(state.is_suppressed(Instant::now()));
        assert_eq!(state.remaining(Instant::now()), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_retry_after_is_capped() {
        let policy = RetryPolicy::default();
        let mut state = BackoffState::new();

        let delay = state.record_failure(&policy, Some(Duration::from_secs(u64::MAX)));
        assert_eq!(delay, DEFAULT_MAX_RETRY_DELAY);
        assert_eq!(state.remaining(Instant::now()), DEFAULT_MAX_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_policy_is_held_to_the_hard_ceiling() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::MAX);
        let mut state = BackoffState::new();

        let delay = state.record_failure(&policy, Some(Duration::MAX));
        assert_eq!(delay, MAX_BACKOFF_WINDOW);
        assert!(state.is_suppressed(Instant::now() + Duration::from_secs(3600)));
    }
}
