//! Reconnection backoff policy.
//!
//! Kept apart from the connection so the delay schedule can be tested
//! without a socket.

use std::time::Duration;

/// Exponential backoff configuration for hub reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// Iterate the delays this policy produces, starting at `initial_delay`.
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            cap: self.max_delay,
        }
    }
}

/// `min(current * 2, cap)`.
pub fn next_delay(current: Duration, cap: Duration) -> Duration {
    current.saturating_mul(2).min(cap)
}

/// Infinite, non-decreasing delay schedule: 1s, 2s, 4s, ... cap, cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.cap);
        self.next = next_delay(current, self.cap);
        Some(current)
    }
}
