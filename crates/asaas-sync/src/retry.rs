//! Backoff policy for transient push failures.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a row is given up on and marked `error`
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            backoff_factor: 3.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &asaas_core::config::SyncConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.initial_backoff_ms),
            max_delay: Duration::from_millis(cfg.max_backoff_ms.max(cfg.initial_backoff_ms)),
            backoff_factor: if cfg.backoff_factor >= 1.0 {
                cfg.backoff_factor
            } else {
                1.0
            },
        }
    }

    /// Tight timings for tests
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_factor: 2.0,
        }
    }

    /// Delay before the next try after `attempt` failures (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Whether `attempts` failures exhaust the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(15));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(30));
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(30));
        assert!(!p.exhausted(2));
        assert!(p.exhausted(3));
    }

    #[test]
    fn test_from_config_clamps() {
        let cfg = asaas_core::config::SyncConfig {
            max_attempts: 0,
            backoff_factor: 0.5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 1_000,
            ..Default::default()
        };
        let p = RetryPolicy::from_config(&cfg);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.backoff_factor, 1.0);
        assert_eq!(p.max_delay, Duration::from_millis(2_000));
    }
}
