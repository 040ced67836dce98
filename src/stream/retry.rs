//! Pluggable retry policy for stream decoding hiccups.
//!
//! Retries are confined to transport-level failures while pulling SSE
//! frames; adapters never retry whole HTTP requests.

use std::time::Duration;

use crate::error::Error;

/// Decides whether a decoder error is worth another attempt and how long to
/// back off before it.
pub trait RetryStrategy: Send {
    fn should_retry(&self, err: &Error) -> bool;

    /// Delay before the next attempt; implementations may advance internal
    /// state (attempt counters) here.
    fn next_delay(&mut self) -> Duration;

    fn reset(&mut self);
}

/// Exponential backoff: `base * 2^attempt`, capped, with a bounded number of
/// attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    max_retries: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap,
            max_retries,
            attempt: 0,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5), 3)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(&self, err: &Error) -> bool {
        self.attempt < self.max_retries && err.is_retryable()
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.base.as_millis() as u64;
        let cap = self.cap.as_millis() as u64;
        let delay = base
            .saturating_mul(1u64 << self.attempt.min(16))
            .min(cap);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Never retries; every decoder error surfaces immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn should_retry(&self, _err: &Error) -> bool {
        false
    }

    fn next_delay(&mut self) -> Duration {
        Duration::ZERO
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut retry =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350), 10);
        assert_eq!(retry.next_delay(), Duration::from_millis(100));
        assert_eq!(retry.next_delay(), Duration::from_millis(200));
        assert_eq!(retry.next_delay(), Duration::from_millis(350));
        retry.reset();
        assert_eq!(retry.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn attempts_are_bounded() {
        let mut retry = ExponentialBackoff::new(Duration::ZERO, Duration::ZERO, 2);
        // Non-retryable error kinds are refused outright.
        assert!(!retry.should_retry(&Error::MalformedResponse("x".into())));
        assert!(!retry.should_retry(&Error::Cancelled));

        retry.next_delay();
        retry.next_delay();
        // Budget exhausted.
        assert!(!retry.should_retry(&Error::MalformedResponse("y".into())));
    }
}
