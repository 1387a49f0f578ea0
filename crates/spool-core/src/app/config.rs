//! Configuration of the coordination layer.

use std::time::Duration;

use serde::Deserialize;

use super::backoff::BackoffPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("lock_ttl_ms must be at least 3ms so the heartbeat period (ttl / 3) is non-zero")]
    LockTtlTooShort,

    #[error("reconnect_base_delay_ms must not exceed reconnect_max_delay_ms")]
    ReconnectDelays,

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Every knob the coordination layer reads. Durations are milliseconds.
///
/// ```ignore
/// let config = CoordinationConfig::from_json_str(r#"{ "poll_interval_ms": 5000 }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinationConfig {
    /// A lease older than this is treated as abandoned and reclaimed.
    pub invisibility_timeout_ms: u64,

    /// Lock document lifetime; the heartbeat refreshes it every ttl / 3.
    pub lock_ttl_ms: u64,

    /// Budget for acquiring the bootstrap lock.
    pub lock_acquire_timeout_ms: u64,

    /// Upper bound on how long a fetcher waits before re-polling the store.
    pub poll_interval_ms: u64,

    /// Records kept by the notification log before the oldest are evicted.
    pub notification_log_capacity: usize,

    /// Period of the observer's defensive wake of every known queue.
    pub fallback_wake_interval_ms: u64,

    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,

    /// Undelivered signals a queue may accumulate in the semaphore.
    pub semaphore_max_pending: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            invisibility_timeout_ms: 30 * 60 * 1000,
            lock_ttl_ms: 30_000,
            lock_acquire_timeout_ms: 60_000,
            poll_interval_ms: 15_000,
            notification_log_capacity: 10_000,
            fallback_wake_interval_ms: 60_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 60_000,
            semaphore_max_pending: 1024,
        }
    }
}

impl CoordinationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("invisibility_timeout_ms", self.invisibility_timeout_ms),
            ("lock_ttl_ms", self.lock_ttl_ms),
            ("lock_acquire_timeout_ms", self.lock_acquire_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("notification_log_capacity", self.notification_log_capacity as u64),
            ("fallback_wake_interval_ms", self.fallback_wake_interval_ms),
            ("reconnect_base_delay_ms", self.reconnect_base_delay_ms),
            ("reconnect_max_delay_ms", self.reconnect_max_delay_ms),
            ("semaphore_max_pending", self.semaphore_max_pending),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.lock_ttl_ms < 3 {
            return Err(ConfigError::LockTtlTooShort);
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::ReconnectDelays);
        }
        Ok(())
    }

    pub fn invisibility_timeout(&self) -> Duration {
        Duration::from_millis(self.invisibility_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fallback_wake_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_wake_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
        )
    }
}
