//! Liveness tracking for an open connection.

use std::time::Duration;

use tether_core::config::HeartbeatConfig;
use tokio::time::Instant;

/// Tracks inbound traffic against a silence threshold.
///
/// Created when a connection opens and dropped when it leaves Open.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_seen: Instant,
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_seen: Instant::now(),
        }
    }

    #[must_use]
    pub fn from_config(config: &HeartbeatConfig) -> Self {
        Self::new(
            Duration::from_millis(config.interval_ms),
            Duration::from_millis(config.timeout_ms),
        )
    }

    /// Ping period.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Any inbound frame counts as proof of life.
    pub fn record_traffic(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_seen.elapsed()
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.silence() > self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_after_silence() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(30), Duration::from_secs(90));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!hb.is_expired());

        hb.record_traffic();
        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(!hb.is_expired());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(hb.is_expired());
    }

    #[test]
    fn reads_config() {
        let hb = HeartbeatMonitor::from_config(&HeartbeatConfig::default());
        assert_eq!(hb.interval(), Duration::from_secs(30));
    }
}
