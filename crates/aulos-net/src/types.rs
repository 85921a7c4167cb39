use std::time::Duration;

/// Bounded exponential-backoff schedule.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub total_retry: u32,
    /// Base delay; attempt `n` waits `base_delay * 2^(n-1)`.
    pub base_delay: Duration,
    /// Hard cap on a single delay.
    pub max_delay: Duration,
    /// Quiet period after which the attempt counter resets.
    pub reset_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            total_retry: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            reset_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Undithered delay before attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)));
        exponential.min(self.max_delay)
    }

    /// Delay with +-20% dither so parallel retries do not align.
    #[must_use]
    pub fn dithered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if base.is_zero() {
            return base;
        }
        // Cheap entropy source; the exact distribution does not matter here.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.subsec_nanos());
        let unit = f64::from(nanos % 1_000) / 1_000.0;
        let factor = 0.8 + 0.4 * unit;
        base.mul_f64(factor)
    }
}
