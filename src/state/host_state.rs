use crate::config::FrontierConfig;
use std::time::{Duration, Instant};

/// Tracks per-host dispatch state inside the frontier
///
/// Bounds how many items for one host are in flight at once and how soon
/// the next one may be handed out.
#[derive(Debug, Clone, Default)]
pub struct HostState {
    /// Items dispatched to workers and not yet completed
    pub active: usize,

    /// When the last item for this host was dispatched
    pub last_dispatch: Option<Instant>,
}

impl HostState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks if another item for this host may be dispatched at `now`
    pub fn can_dispatch(&self, config: &FrontierConfig, now: Instant) -> bool {
        if self.active >= config.per_host_concurrency {
            return false;
        }
        self.time_until_dispatch(config, now).is_none()
    }

    /// Time left before the minimum host interval has elapsed
    ///
    /// Returns None if the interval has already passed. Concurrency is not
    /// considered: a host at its limit frees up on completion, not on a timer.
    pub fn time_until_dispatch(&self, config: &FrontierConfig, now: Instant) -> Option<Duration> {
        let last = self.last_dispatch?;
        let min_interval = Duration::from_millis(config.min_host_interval_ms);
        let elapsed = now.saturating_duration_since(last);
        if elapsed < min_interval {
            Some(min_interval - elapsed)
        } else {
            None
        }
    }

    pub fn record_dispatch(&mut self, now: Instant) {
        self.active += 1;
        self.last_dispatch = Some(now);
    }

    pub fn record_complete(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn is_idle(&self) -> bool {
        self.active == 0
    }
}
