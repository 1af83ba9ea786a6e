//! PIN-gated session tracking for HIGH/CRITICAL commands (spec §4.5 point 3).
//! A user authenticates with `/pin <secret>`; the session stays valid for
//! 60s from the last successful `/pin`.

use std::collections::HashMap;

const SESSION_WINDOW_SEC: i64 = 60;

#[derive(Default)]
pub struct PinSessions {
    authenticated_at: HashMap<String, i64>,
}

impl PinSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authenticate(&mut self, user_id: &str, now: i64) {
        self.authenticated_at.insert(user_id.to_string(), now);
    }

    pub fn is_valid(&self, user_id: &str, now: i64) -> bool {
        self.authenticated_at
            .get(user_id)
            .map(|&at| now - at <= SESSION_WINDOW_SEC)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_valid_within_window() {
        let mut s = PinSessions::new();
        s.authenticate("u1", 0);
        assert!(s.is_valid("u1", 60));
        assert!(!s.is_valid("u1", 61));
    }

    #[test]
    fn unauthenticated_user_is_invalid() {
        let s = PinSessions::new();
        assert!(!s.is_valid("u1", 0));
    }
}
