//! Backoff policy shared by the observer's reconnect loop and the lock's
//! acquire loop.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    pub multiplier: f64,

    /// Delays never grow beyond this.
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier: 2.0,
            max_delay,
        }
    }

    /// Stream reconnects: 500ms doubling up to a minute.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }

    /// Lock acquire retries: short and flat enough that a released lock is
    /// picked up quickly.
    pub fn lock_retry() -> Self {
        Self {
            base_delay: Duration::from_millis(20),
            multiplier: 1.5,
            max_delay: Duration::from_millis(500),
        }
    }

    /// Delay before retry number `attempts` (1-indexed):
    /// `min(base_delay * multiplier^(attempts - 1), max_delay)`.
    ///
    /// With base=500ms, multiplier=2.0, max=60s:
    /// 500ms, 1s, 2s, 4s, ... 32s, 60s, 60s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    /// `next_delay` spread uniformly over its upper half, so processes that
    /// failed together do not retry together.
    pub fn jittered_delay(&self, attempts: u32) -> Duration {
        let delay = self.next_delay(attempts);
        let floor = delay / 2;
        if delay <= floor {
            return delay;
        }
        rand::thread_rng().gen_range(floor..=delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}
