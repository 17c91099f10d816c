//! Re-queue policy for failed outbound messages.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// How failed outbound messages are put back in the send queue.
///
/// `max_attempts` counts every send attempt including the first, so `1`
/// means a failure is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Failures are terminal.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_secs(300),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }

    /// Whether a message that failed after `attempts` tries has any left.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.is_enabled() && attempts < self.max_attempts
    }

    /// When a message that just failed its `attempts`-th try may be
    /// re-queued, or `None` if it is out of attempts.
    pub fn retry_at(&self, attempts: u32, failed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.allows_retry(attempts)
            .then(|| self.next_attempt_at(attempts, failed_at))
    }

    /// When the next attempt may run: linear backoff scaled by attempts so far.
    pub fn next_attempt_at(&self, attempts: u32, failed_at: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.saturating_mul(attempts.max(1));
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        failed_at.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
