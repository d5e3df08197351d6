//! Exponential backoff between connection attempts.

use std::time::Duration;

use tether_core::config::ReconnectConfig;

/// Pure delay schedule; [`Backoff`] tracks the attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    #[must_use]
    pub const fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// `min(base * 2^(attempt-1), cap)`; zero for attempt 0.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Attempt counter driving a [`ReconnectPolicy`].
///
/// Starts at attempt 0 so the first connection is immediate.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new() -> Self {
        Self { attempt: 0 }
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next connection attempt.
    #[must_use]
    pub fn delay(&self, policy: &ReconnectPolicy) -> Duration {
        policy.next_delay(self.attempt)
    }

    /// A connection completed its handshake.
    pub const fn on_open(&mut self) {
        self.attempt = 0;
    }

    /// An attempt failed or an established connection was lost.
    pub const fn on_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Start over, e.g. after the target address changed.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }
}
