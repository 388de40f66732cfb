//! Retry policy for the update call and the runaway-update guard.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::LeaseManagerConfig;

/// Capped exponential backoff: `min(base * 2^(failures - 1), max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_retries: u32,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max,
            max_retries,
            failures: 0,
        }
    }

    pub fn from_config(cfg: &LeaseManagerConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_max_ms),
            cfg.max_update_retries,
        )
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure. Returns the delay before the next attempt, or
    /// `None` once more than `max_retries` consecutive failures were seen.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_retries {
            return None;
        }
        Some(self.delay_for(self.failures))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Counts updates over a trailing window. Too many means something is
/// flapping, and the caller should slow down.
#[derive(Debug, Clone)]
pub struct UpdateRateLimiter {
    window: Duration,
    max_updates: usize,
    delay: Duration,
    stamps: VecDeque<Instant>,
}

impl UpdateRateLimiter {
    pub fn new(window: Duration, max_updates: usize, delay: Duration) -> Self {
        Self {
            window,
            max_updates,
            delay,
            stamps: VecDeque::new(),
        }
    }

    pub fn from_config(cfg: &LeaseManagerConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.rate_limit_window_ms),
            cfg.rate_limit_max_updates,
            Duration::from_millis(cfg.rate_limit_delay_ms),
        )
    }

    /// Records an update at `now`; returns a delay to apply before sending
    /// when the window is over budget.
    pub fn record(&mut self, now: Instant) -> Option<Duration> {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        self.stamps.push_back(now);
        (self.stamps.len() > self.max_updates).then_some(self.delay)
    }
}
