use std::time::Duration;

use crate::config::ReconnectConfig;

/// Delay sequence for reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and return how long to wait before the next.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.max(1.0).powi(exponent);
        self.attempt = self.attempt.saturating_add(1);

        let nanos = self.config.initial_delay.as_nanos() as f64 * factor;
        if nanos.is_finite() && nanos < self.config.max_delay.as_nanos() as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            self.config.max_delay
        }
    }

    /// Whether the attempt budget for the initial connect is spent.
    pub fn exhausted(&self) -> bool {
        self.config
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_multiplier(2.0)
            .with_max_attempts(Some(3))
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let mut backoff = Backoff::new(config());
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn budget_and_reset() {
        let mut backoff = Backoff::new(config());
        assert!(!backoff.exhausted());
        for _ in 0..3 {
            backoff.next_delay();
        }
        assert!(backoff.exhausted());
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert!(!backoff.exhausted());
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn unlimited_attempts_never_exhaust() {
        let mut backoff = Backoff::new(config().with_max_attempts(None));
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert!(!backoff.exhausted());
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn multiplier_below_one_is_constant() {
        let mut backoff = Backoff::new(config().with_multiplier(0.5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
