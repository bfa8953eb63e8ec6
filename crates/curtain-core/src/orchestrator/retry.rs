use std::time::Duration;

use rand::Rng;

use crate::error::FailureClass;

/// Exponential backoff for retryable failures.
///
/// The delay after attempt `n` fails is `base_delay * 2^(n-1)`, capped at
/// `max_delay`, then spread by up to `jitter` in either direction.
/// Long-backoff failures (quota) scale both the delay and the cap by
/// `long_backoff_multiplier`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts in a chain, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay, in `[0, 1)`.
    pub jitter: f64,
    pub long_backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            jitter: 0.2,
            long_backoff_multiplier: 10,
        }
    }
}

impl RetryPolicy {
    /// Whether a chain that just failed attempt `attempt_number` may go again.
    pub fn can_retry(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_attempts
    }

    /// Backoff before the attempt following `attempt_number`, without jitter.
    pub fn base_delay_for(&self, attempt_number: u32, class: FailureClass) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(20);
        let scaled = self.base_delay.saturating_mul(1u32 << exponent);
        let (delay, cap) = match class {
            FailureClass::RetryableLongBackoff => (
                scaled.saturating_mul(self.long_backoff_multiplier.max(1)),
                self.max_delay.saturating_mul(self.long_backoff_multiplier.max(1)),
            ),
            _ => (scaled, self.max_delay),
        };
        delay.min(cap)
    }

    pub fn delay_for(&self, attempt_number: u32, class: FailureClass) -> Duration {
        self.delay_with(attempt_number, class, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng>(
        &self,
        attempt_number: u32,
        class: FailureClass,
        rng: &mut R,
    ) -> Duration {
        let delay = self.base_delay_for(attempt_number, class);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0))
    }
}
