//! Capped exponential backoff shared by delivery retries and module restarts

use std::time::Duration;

/// `base * 2^attempt`, never above `max`
pub fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Retry delay tracker. `next_delay` grows the delay, `reset` starts over.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = exponential(self.base, self.max, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Adopt new bounds without losing the attempt count
    pub fn reconfigure(&mut self, base: Duration, max: Duration) {
        self.base = base;
        self.max = max.max(base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(backoff.attempts(), 6);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_counts_stay_capped() {
        let cap = Duration::from_secs(300);
        assert_eq!(exponential(Duration::from_secs(5), cap, 1_000), cap);
    }
}
