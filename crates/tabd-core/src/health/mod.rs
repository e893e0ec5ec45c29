//! Consecutive-failure counter driving a degraded health signal.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use chrono::Utc;
use tracing::warn;

pub struct HealthTracker {
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    last_successful_nav_millis: AtomicI64,
    is_recovering: AtomicBool,
    active_ops: AtomicU32,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub consecutive_failures: u32,
    pub active_ops: u32,
    pub is_recovering: bool,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            consecutive_failures: AtomicU32::new(0),
            last_successful_nav_millis: AtomicI64::new(Utc::now().timestamp_millis()),
            is_recovering: AtomicBool::new(false),
            active_ops: AtomicU32::new(0),
        }
    }

    pub fn record_nav_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.last_successful_nav_millis
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Returns `true` iff this failure pushed the counter to the threshold.
    pub fn record_nav_failure(&self) -> bool {
        let updated = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        updated >= self.failure_threshold
    }

    pub fn begin_op(&self) {
        self.active_ops.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_op(&self) {
        self.active_ops.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn set_recovering(&self, recovering: bool) {
        self.is_recovering.store(recovering, Ordering::SeqCst);
    }

    pub fn is_recovering(&self) -> bool {
        self.is_recovering.load(Ordering::SeqCst)
    }

    /// Periodic probe: warn if the process has gone idle for over two
    /// minutes without a successful navigation. Does not mutate state.
    pub fn probe(&self) {
        if self.active_ops.load(Ordering::SeqCst) != 0 {
            return;
        }
        let last = self.last_successful_nav_millis.load(Ordering::SeqCst);
        let idle_millis = Utc::now().timestamp_millis() - last;
        if idle_millis > 120_000 {
            warn!(idle_millis, "no successful navigation in over 120s while idle");
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            active_ops: self.active_ops.load(Ordering::SeqCst),
            is_recovering: self.is_recovering(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_threshold_trips_once_reached() {
        let tracker = HealthTracker::new(3);
        assert!(!tracker.record_nav_failure());
        assert!(!tracker.record_nav_failure());
        assert!(tracker.record_nav_failure());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let tracker = HealthTracker::new(3);
        tracker.record_nav_failure();
        tracker.record_nav_failure();
        tracker.record_nav_success();
        assert_eq!(tracker.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn recovering_flag_round_trips() {
        let tracker = HealthTracker::new(3);
        assert!(!tracker.is_recovering());
        tracker.set_recovering(true);
        assert!(tracker.is_recovering());
    }
}
