//! Reconnection policy for the transport channel.
//!
//! Backoff is linear: attempt `n` waits `base_delay_ms × n`. The attempt counter
//! resets on every successful open. The wait itself is a [`RetryTimer`] owned by
//! the channel so that an intentional disconnect cancels a pending retry
//! immediately instead of letting it fire later.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Default number of reconnection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay between reconnection attempts.
pub const DEFAULT_BASE_DELAY_MS: u64 = 2000;

/// Configuration for automatic reconnection behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    /// Enable automatic reconnection on unexpected connection loss.
    /// Default: true
    pub enabled: bool,

    /// Maximum number of reconnection attempts before giving up.
    /// Set to 0 for unlimited attempts.
    /// Default: 3
    pub max_attempts: u32,

    /// Delay unit between reconnection attempts (milliseconds).
    /// Attempt `n` waits `n` units.
    /// Default: 2000ms
    pub base_delay_ms: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }
}

impl ReconnectionConfig {
    /// Create a config with reconnection disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay in milliseconds before the given (1-based) attempt.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        self.base_delay_ms.saturating_mul(u64::from(attempt.max(1)))
    }

    /// Check if another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempts_made < self.max_attempts)
    }
}

/// Per-connection retry bookkeeping.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectionConfig,
    attempt: u32,
}

impl ReconnectPolicy {
    /// Create a policy with no attempts made.
    pub fn new(config: ReconnectionConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of attempts made since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Schedule the next attempt, or `None` when the cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.config.should_retry(self.attempt) {
            return None;
        }
        self.attempt += 1;
        Some(Duration::from_millis(
            self.config.calculate_delay(self.attempt),
        ))
    }

    /// Reset after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Cancellable wait used between reconnection attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryTimer {
    token: CancellationToken,
}

impl RetryTimer {
    /// Timer bound to an existing cancellation token.
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Sleep for `delay`. Returns `false` if the timer was cancelled first.
    pub async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Cancel the pending wait, and every future one.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the timer has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnection_config_default() {
        let config = ReconnectionConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 2000);
    }

    #[test]
    fn test_linear_backoff_schedule() {
        let mut policy = ReconnectPolicy::new(ReconnectionConfig {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 2000,
        });

        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(4000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(6000)));
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt(), 3);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::new(ReconnectionConfig::default());
        policy.next_delay();
        policy.next_delay();
        policy.reset();

        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn test_disabled_never_retries() {
        let mut policy = ReconnectPolicy::new(ReconnectionConfig::disabled());
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn test_unlimited_attempts() {
        let config = ReconnectionConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.should_retry(0));
        assert!(config.should_retry(1000));
        assert_eq!(config.calculate_delay(10), 20000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_elapses() {
        let timer = RetryTimer::default();
        assert!(timer.wait(Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_cancel() {
        let timer = RetryTimer::default();
        let waiter = timer.clone();
        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(60)).await });

        tokio::task::yield_now().await;
        timer.cancel();

        assert!(!handle.await.unwrap());
        assert!(timer.is_cancelled());
    }
}
