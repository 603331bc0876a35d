//! Per-host circuit breaker
//!
//! A host that keeps failing transiently is suspended for a cooldown window.
//! While suspended its items are deferred instead of fetched. When the window
//! ends the host is half-open: exactly one trial request goes through while
//! everything else stays deferred. A failed trial reopens the circuit, a
//! successful one closes it fully.

use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Whether a host may be contacted now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Closed,
    /// The caller holds the single half-open request and must resolve it with
    /// `record_success`, `record_failure` or `release_trial`
    Trial,
    Open { retry_in: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    hosts: DashMap<String, BreakerState>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }

    pub fn check(&self, host: &str) -> BreakerDecision {
        self.check_at(host, Instant::now())
    }

    pub fn check_at(&self, host: &str, now: Instant) -> BreakerDecision {
        let Some(mut state) = self.hosts.get_mut(host) else {
            return BreakerDecision::Closed;
        };

        match state.open_until {
            Some(until) if now < until => BreakerDecision::Open {
                retry_in: until - now,
            },
            Some(_) => {
                // Half-open: one more failure trips it again
                state.open_until = None;
                state.trial_in_flight = true;
                state.consecutive_failures = self.threshold - 1;
                tracing::info!(host = %host, "circuit half-open");
                BreakerDecision::Trial
            }
            None if state.trial_in_flight => BreakerDecision::Open {
                retry_in: self.cooldown,
            },
            None => BreakerDecision::Closed,
        }
    }

    /// Gives up a trial that never reached the host
    pub fn release_trial(&self, host: &str) {
        if let Some(mut state) = self.hosts.get_mut(host) {
            if state.trial_in_flight {
                state.trial_in_flight = false;
                // Back to open-and-expired so the next check claims a new trial
                state.open_until = Some(Instant::now());
            }
        }
    }

    pub fn record_success(&self, host: &str) {
        if let Some((_, state)) = self.hosts.remove(host) {
            if state.consecutive_failures > 0 {
                tracing::debug!(host = %host, "circuit closed");
            }
        }
    }

    /// Records a transient failure; returns true if this failure opened the circuit
    pub fn record_failure(&self, host: &str) -> bool {
        self.record_failure_at(host, Instant::now())
    }

    pub fn record_failure_at(&self, host: &str, now: Instant) -> bool {
        let mut state = self.hosts.entry(host.to_string()).or_default();
        state.consecutive_failures += 1;
        state.trial_in_flight = false;

        if state.open_until.is_none() && state.consecutive_failures >= self.threshold {
            state.open_until = Some(now + self.cooldown);
            tracing::warn!(
                host = %host,
                failures = state.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "circuit opened"
            );
            return true;
        }
        false
    }
}
