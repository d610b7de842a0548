//! Per-host GCRA admission control.
//!
//! Every proxy client owns one limiter; keys are target hostnames. The
//! algorithm tracks a theoretical arrival time (TAT) per key: a request of
//! cost `n` advances the TAT by `n` emission intervals, and is admitted as
//! long as the advanced TAT stays within the burst tolerance window. A cost
//! of zero probes the current state without consuming anything, which lets
//! the scheduler compare candidate proxies before committing to one.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub limited: bool,
    /// Wall-clock delay until the same call would be admitted.
    pub retry_after: Duration,
}

impl RateLimitOutcome {
    pub fn admitted() -> Self {
        Self {
            limited: false,
            retry_after: Duration::ZERO,
        }
    }

    pub fn limited_for(retry_after: Duration) -> Self {
        Self {
            limited: true,
            retry_after,
        }
    }
}

/// Keyed GCRA rate limiter.
pub struct GcraLimiter {
    emission_interval: Duration,
    tolerance: Duration,
    tat: DashMap<String, Instant>,
}

impl GcraLimiter {
    /// Quota of `per_min` requests per minute with `burst` extra requests
    /// admitted momentarily beyond the steady rate.
    pub fn new(per_min: u32, burst: u32) -> Self {
        let per_min = per_min.max(1);
        let emission_interval = Duration::from_secs(60) / per_min;
        Self {
            emission_interval,
            tolerance: emission_interval * (burst + 1),
            tat: DashMap::new(),
        }
    }

    /// Check admission for `cost` cells against `key`. Admission consumes the
    /// cost; denial consumes nothing and reports the delay until admission.
    /// `cost == 0` is a pure probe.
    pub fn check(&self, key: &str, cost: u32) -> RateLimitOutcome {
        let now = Instant::now();
        let mut entry = self.tat.entry(key.to_string()).or_insert(now);
        let tat = (*entry).max(now);
        let candidate = tat + self.emission_interval * cost;

        let horizon = now + self.tolerance;
        if candidate > horizon {
            return RateLimitOutcome::limited_for(candidate - horizon);
        }

        *entry = candidate;
        RateLimitOutcome::admitted()
    }

    /// Unconditionally consume `cost` cells against `key`, pushing the key
    /// past its tolerance window when the cost is large. Used to back off a
    /// (proxy, host) pairing after the target signalled overload.
    pub fn penalize(&self, key: &str, cost: u32) {
        let now = Instant::now();
        let mut entry = self.tat.entry(key.to_string()).or_insert(now);
        let tat = (*entry).max(now);
        *entry = tat + self.emission_interval * cost;
    }
}
