//! Bounded retry policy for replication bootstrap

use std::time::Duration;

/// Delay strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every attempt
    Fixed(Duration),
    /// Doubling delay, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

/// How many times to try, and how long to sleep before each try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Same delay before every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Delay to sleep before attempt number `attempt` (1-based)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial
                    .checked_mul(1u32 << shift)
                    .map_or(max, |d| d.min(max))
            }
        }
    }

    /// Attempt numbers paired with the delay preceding each
    pub fn schedule(&self) -> impl Iterator<Item = (u32, Duration)> + '_ {
        (1..=self.max_attempts).map(move |attempt| (attempt, self.delay_before(attempt)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        let delays: Vec<_> = policy.schedule().collect();
        assert_eq!(
            delays,
            vec![
                (1, Duration::from_secs(10)),
                (2, Duration::from_secs(10)),
                (3, Duration::from_secs(10)),
            ]
        );
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(
            6,
            Backoff::Exponential {
                initial: Duration::from_secs(2),
                max: Duration::from_secs(10),
            },
        );
        let delays: Vec<u64> = policy.schedule().map(|(_, d)| d.as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10, 10]);
    }

    #[test]
    fn test_exponential_overflow_saturates() {
        let policy = RetryPolicy::new(
            1,
            Backoff::Exponential {
                initial: Duration::from_secs(u64::MAX / 2),
                max: Duration::from_secs(60),
            },
        );
        assert_eq!(policy.delay_before(40), Duration::from_secs(60));
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts(), 1);
    }
}
