//! Shared runtime state for `ctl-chatd`: config, the bus pool, and the two
//! in-memory guards (rate limiter, PIN sessions) that only this process
//! needs — unlike the worker's breaker, neither is persisted, since an
//! ingress restart simply re-requires `/pin` and resets everyone's quota.

use ctl_config::Config;
use sqlx::SqlitePool;

use crate::pin::PinSessions;
use crate::rate_limit::RateLimiter;

pub struct ChatState {
    pub db: SqlitePool,
    pub config: Config,
    pub rate_limiter: RateLimiter,
    pub pin_sessions: PinSessions,
}

impl ChatState {
    pub fn new(db: SqlitePool, config: Config) -> Self {
        let rate_limiter = RateLimiter::new(config.chat_rate_limit_per_min, 60);
        Self {
            db,
            config,
            rate_limiter,
            pin_sessions: PinSessions::new(),
        }
    }

    pub fn is_allowlisted(&self, user_id: &str) -> bool {
        self.config.chat_allowlist.iter().any(|u| u == user_id)
    }
}
