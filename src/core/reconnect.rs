use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::types::ReconnectStrategy;

/// Jitter applied around every computed reconnect delay (±20%).
pub const JITTER_RATIO: f64 = 0.2;

/// `min(max, base × factor^attempt)`, the un-jittered delay for attempt `n` (counted from 0).
pub fn backoff_delay(base: Duration, max: Duration, factor: f64, attempt: u32) -> Duration {
    let exp = factor.powi(attempt.min(i32::MAX as u32) as i32);
    let secs = base.as_secs_f64() * exp;
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs)
}

/// Scale `base` by a uniformly random factor in `[1 - ratio, 1 + ratio]`.
pub fn jitter_delay(base: Duration, ratio: f64) -> Duration {
    if base.is_zero() || ratio <= 0.0 {
        return base;
    }

    let mut rng = SmallRng::from_entropy();
    let jitter: f64 = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
    let nanos = (base.as_nanos() as f64 * jitter) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// Bounded exponential backoff reconnect strategy.
///
/// Policy lives in the strategy, not in the link actor: callers select base/max/factor and the
/// attempt budget.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffReconnect {
    base: Duration,
    max: Duration,
    factor: f64,
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoffReconnect {
    pub fn new(base: Duration, max: Duration, factor: f64, max_attempts: u32) -> Self {
        let factor = if factor.is_finite() && factor > 1.0 {
            factor
        } else {
            1.5
        };
        Self {
            base,
            max: max.max(base),
            factor,
            max_attempts,
            attempt: 0,
        }
    }

    /// Un-jittered delay for a given attempt index.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base, self.max, self.factor, attempt)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ExponentialBackoffReconnect {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, 10)
    }
}

impl ReconnectStrategy for ExponentialBackoffReconnect {
    fn next_delay(&mut self) -> Duration {
        let delay = jitter_delay(self.delay_for(self.attempt), JITTER_RATIO);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    fn attempts(&self) -> u32 {
        self.attempt
    }
}
