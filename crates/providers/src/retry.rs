//! Capped exponential backoff for retryable provider/transport failures.

use std::time::Duration;

/// Doubling backoff with a hard attempt cap. The run executor wraps stream
/// opens with this; a `None` from [`next_delay`](Backoff::next_delay) means
/// the failure is final.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_ms,
            max_ms,
            max_attempts,
            attempt: 0,
        }
    }

    /// Defaults used around LLM stream opens.
    pub fn for_provider() -> Self {
        Self::new(500, 8_000, 4)
    }

    /// The delay before the next retry, or `None` when attempts are spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.attempt.min(20);
        let ms = self
            .base_ms
            .checked_shl(exp)
            .unwrap_or(self.max_ms)
            .min(self.max_ms);
        self.attempt += 1;
        Some(Duration::from_millis(ms))
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut b = Backoff::new(100, 1000, 10);
        let delays: Vec<u64> = std::iter::from_fn(|| b.next_delay())
            .take(6)
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut b = Backoff::new(10, 100, 2);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
        assert_eq!(b.attempts_used(), 2);
    }

    #[test]
    fn zero_attempts_means_no_retry()  {
        let mut b = Backoff::new(10, 100, 0);
        assert!(b.next_delay().is_none());
    }
}
