//! Time the visitor spent with the page visible
//!
//! The clock runs while the page is visible and stops while it is hidden.
//! Times are milliseconds on the tracker's scheduler clock.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct EngagementState {
    accumulated_ms: i64,
    started_at: Option<i64>,
}

/// Accumulates visible time across pause/resume cycles
#[derive(Debug, Default)]
pub struct EngagementTimer {
    state: Mutex<EngagementState>,
}

impl EngagementTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting at `now`. No-op while already running.
    pub fn start(&self, now: i64) {
        let mut state = self.lock();
        if state.started_at.is_none() {
            state.started_at = Some(now);
        }
    }

    /// Stop counting and bank the running interval
    pub fn pause(&self, now: i64) {
        let mut state = self.lock();
        if let Some(started) = state.started_at.take() {
            state.accumulated_ms += (now - started).max(0);
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().started_at.is_some()
    }

    /// Banked time plus the running interval, if any
    pub fn engaged(&self, now: i64) -> Duration {
        let state = self.lock();
        let running = state.started_at.map_or(0, |started| (now - started).max(0));
        Duration::from_millis((state.accumulated_ms + running) as u64)
    }

    /// Zero the total. Keeps running from `now` if it was running.
    pub fn reset(&self, now: i64) {
        let mut state = self.lock();
        state.accumulated_ms = 0;
        if state.started_at.is_some() {
            state.started_at = Some(now);
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngagementState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_only_visible_time() {
        let timer = EngagementTimer::new();
        timer.start(1_000);
        timer.pause(4_000);
        // Hidden from 4s to 10s.
        assert_eq!(timer.engaged(10_000), Duration::from_secs(3));

        timer.start(10_000);
        assert!(timer.is_running());
        assert_eq!(timer.engaged(12_500), Duration::from_millis(5_500));
    }

    #[test]
    fn test_start_and_pause_are_idempotent() {
        let timer = EngagementTimer::new();
        timer.pause(500);
        timer.start(1_000);
        timer.start(2_000);
        timer.pause(3_000);
        timer.pause(9_000);
        assert_eq!(timer.engaged(9_000), Duration::from_secs(2));
    }

    #[test]
    fn test_reset_keeps_running_state() {
        let timer = EngagementTimer::new();
        timer.start(0);
        timer.reset(5_000);
        assert_eq!(timer.engaged(6_000), Duration::from_secs(1));

        timer.pause(6_000);
        timer.reset(7_000);
        assert!(!timer.is_running());
        assert_eq!(timer.engaged(20_000), Duration::ZERO);
    }
}
