//! Per-user sliding-window rate limiter (spec §4.5 point 2), same shape as
//! the worker's circuit breaker but keyed per user instead of process-wide.

use std::collections::{HashMap, VecDeque};

pub struct RateLimiter {
    limit: usize,
    window_sec: i64,
    events: HashMap<String, VecDeque<i64>>,
    /// Last time `rate.limited` was emitted for a user, so the event itself
    /// stays throttled to 1/min (spec §7) even while the user keeps tripping
    /// the limiter on every message.
    last_emitted: HashMap<String, i64>,
}

impl RateLimiter {
    pub fn new(limit_per_min: i64, window_sec: i64) -> Self {
        Self {
            limit: limit_per_min.max(1) as usize,
            window_sec,
            events: HashMap::new(),
            last_emitted: HashMap::new(),
        }
    }

    /// Record an attempt for `user_id` at `now`. Returns `true` if it is
    /// within quota and should proceed.
    pub fn allow(&mut self, user_id: &str, now: i64) -> bool {
        let window_sec = self.window_sec;
        let deque = self.events.entry(user_id.to_string()).or_default();
        while let Some(&front) = deque.front() {
            if now - front > window_sec {
                deque.pop_front();
            } else {
                break;
            }
        }

        if deque.len() >= self.limit {
            return false;
        }

        deque.push_back(now);
        true
    }

    /// Whether a `rate.limited` event should be emitted for `user_id` right
    /// now, given the 1/min throttle.
    pub fn should_emit_rate_limited(&mut self, user_id: &str, now: i64) -> bool {
        match self.last_emitted.get(user_id) {
            Some(&last) if now - last < 60 => false,
            _ => {
                self.last_emitted.insert(user_id.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_blocks() {
        let mut rl = RateLimiter::new(3, 60);
        assert!(rl.allow("u1", 0));
        assert!(rl.allow("u1", 1));
        assert!(rl.allow("u1", 2));
        assert!(!rl.allow("u1", 3));
    }

    #[test]
    fn window_slides() {
        let mut rl = RateLimiter::new(2, 10);
        rl.allow("u1", 0);
        rl.allow("u1", 1);
        assert!(!rl.allow("u1", 5));
        assert!(rl.allow("u1", 11));
    }

    #[test]
    fn users_are_independent() {
        let mut rl = RateLimiter::new(1, 60);
        assert!(rl.allow("u1", 0));
        assert!(rl.allow("u2", 0));
        assert!(!rl.allow("u1", 1));
    }

    #[test]
    fn rate_limited_event_throttled_to_one_per_minute() {
        let mut rl = RateLimiter::new(1, 60);
        assert!(rl.should_emit_rate_limited("u1", 0));
        assert!(!rl.should_emit_rate_limited("u1", 30));
        assert!(rl.should_emit_rate_limited("u1", 61));
    }
}
