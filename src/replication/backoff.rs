//! Per-peer retry backoff
//!
//! Exponential growth from a base delay, capped, with equal jitter: the
//! actual delay is drawn from `[ceiling / 2, ceiling]`.

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
            next_attempt: None,
        }
    }

    /// Upper bound of the delay after `failures` consecutive failures
    pub fn ceiling(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Record a failure and schedule the next attempt; returns the delay
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let ceiling = self.ceiling(self.failures);
        let floor = ceiling / 2;
        let delay = if ceiling > floor {
            rand::thread_rng().gen_range(floor..=ceiling)
        } else {
            ceiling
        };
        self.next_attempt = Some(now + delay);
        delay
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
        self.next_attempt = None;
    }

    /// Time left before the next attempt; `None` once the peer may be
    /// contacted again
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.next_attempt
            .and_then(|at| at.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
