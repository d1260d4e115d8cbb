//! Bounded exponential backoff between failed list/watch cycles.
//!
//! Sequence with the defaults (800ms, 30s): 0.8s, 1.6s, 3.2s, 6.4s, 12.8s, 25.6s, 30s, 30s...

use std::time::Duration;

use kmirror_core::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    /// Delays handed out since the last reset.
    attempt: u32,
}

impl Backoff {
    /// `max` is raised to `initial` if smaller.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial), attempt: 0 }
    }

    pub fn from_config(cfg: &BackoffConfig) -> Self { Self::new(cfg.initial, cfg.max) }

    /// Current delay, then advance: `initial * 2^attempt`, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 { self.attempt }

    /// Whether a failure at the current attempt deserves a warning. Logs the first
    /// failure and then every power-of-two attempt so a long outage stays quiet.
    pub fn should_warn(&self) -> bool { self.attempt == 0 || self.attempt.is_power_of_two() }

    /// Back to the initial delay after a successful cycle.
    pub fn reset(&mut self) { self.attempt = 0; }
}
