//! The circuit breaker (C5): counts handler exceptions in a sliding window
//! and halts further handler execution on threshold, mirroring the
//! fail-closed, single-escape-hatch shape of the teacher's
//! `mqk-integrity::arm_state::ArmState`.

use std::collections::VecDeque;

/// Sliding-window failure counter. The breaker itself does not know about
/// `app_state.breaker_state` — the worker writes that after consulting
/// [`Breaker::record_failure`].
pub struct Breaker {
    threshold: usize,
    window_sec: i64,
    failures: VecDeque<i64>,
}

impl Breaker {
    pub fn new(threshold: i64, window_sec: i64) -> Self {
        Self {
            threshold: threshold.max(1) as usize,
            window_sec,
            failures: VecDeque::new(),
        }
    }

    fn evict_stale(&mut self, now: i64) {
        while let Some(&front) = self.failures.front() {
            if now - front > self.window_sec {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an unexpected handler failure at `now`. Returns `true` if this
    /// failure pushes the sliding-window count to the trip threshold.
    pub fn record_failure(&mut self, now: i64) -> bool {
        self.evict_stale(now);
        self.failures.push_back(now);
        self.failures.len() >= self.threshold
    }

    /// Reset on `state.resume` (spec §4.4).
    pub fn reset(&mut self) {
        self.failures.clear();
    }

    pub fn recent_failure_count(&mut self, now: i64) -> usize {
        self.evict_stale(now);
        self.failures.len()
    }

    /// Timestamps of failures still inside the window, for `breaker.tripped`'s
    /// `recent_errors` field.
    pub fn recent_failures(&mut self, now: i64) -> Vec<i64> {
        self.evict_stale(now);
        self.failures.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_exactly_at_threshold_within_window() {
        let mut b = Breaker::new(5, 60);
        for t in 0..4 {
            assert!(!b.record_failure(t));
        }
        assert!(b.record_failure(4));
    }

    #[test]
    fn failures_outside_window_are_evicted() {
        let mut b = Breaker::new(3, 10);
        b.record_failure(0);
        b.record_failure(1);
        // This failure is 20s later; the first two have aged out.
        let tripped = b.record_failure(20);
        assert!(!tripped);
        assert_eq!(b.recent_failure_count(20), 1);
    }

    #[test]
    fn reset_clears_the_window() {
        let mut b = Breaker::new(2, 60);
        b.record_failure(0);
        assert!(b.record_failure(1));
        b.reset();
        assert!(!b.record_failure(2));
    }
}
