//! Environment-variable configuration (spec §6's Environment table). A
//! single [`Config::from_env`] entry point so no other crate scatters
//! `std::env::var` calls directly; secret-shaped fields redact in `Debug`
//! the same way the teacher's secrets-resolution module does.

use anyhow::{bail, Result};

pub const ENV_BUS_DB_PATH: &str = "BUS_DB_PATH";
pub const ENV_APPROVAL_WINDOW_SEC: &str = "APPROVAL_WINDOW_SEC";
pub const ENV_BREAKER_THRESHOLD: &str = "BREAKER_THRESHOLD";
pub const ENV_BREAKER_WINDOW_SEC: &str = "BREAKER_WINDOW_SEC";
pub const ENV_CHAT_ENABLED: &str = "CHAT_ENABLED";
pub const ENV_CHAT_API_TOKEN: &str = "CHAT_API_TOKEN";
pub const ENV_CHAT_CONTROL_CHANNEL: &str = "CHAT_CONTROL_CHANNEL";
pub const ENV_CHAT_ALLOWLIST: &str = "CHAT_ALLOWLIST";
pub const ENV_CHAT_PIN: &str = "CHAT_PIN";
pub const ENV_CHAT_RATE_LIMIT_PER_MIN: &str = "CHAT_RATE_LIMIT_PER_MIN";
pub const ENV_CHAT_LONG_POLL_SEC: &str = "CHAT_LONG_POLL_SEC";
pub const ENV_DUAL_CONTROL_STRICT: &str = "DUAL_CONTROL_STRICT";
pub const ENV_WORKER_ADDR: &str = "WORKER_ADDR";

pub const DEFAULT_BUS_DB_PATH: &str = "runtime/ctl.db";
const DEFAULT_APPROVAL_WINDOW_SEC: i64 = 90;
const DEFAULT_BREAKER_THRESHOLD: i64 = 5;
const DEFAULT_BREAKER_WINDOW_SEC: i64 = 60;
const DEFAULT_CHAT_RATE_LIMIT_PER_MIN: i64 = 10;
const DEFAULT_CHAT_LONG_POLL_SEC: i64 = 25;

/// Process-wide configuration, resolved once at startup and threaded through
/// as an owned value rather than read ad hoc.
#[derive(Clone)]
pub struct Config {
    pub bus_db_path: String,
    pub approval_window_sec: i64,
    pub breaker_threshold: i64,
    pub breaker_window_sec: i64,
    pub chat_enabled: bool,
    pub chat_api_token: Option<String>,
    pub chat_control_channel: Option<String>,
    pub chat_allowlist: Vec<String>,
    pub chat_pin: Option<String>,
    pub chat_rate_limit_per_min: i64,
    pub chat_long_poll_sec: i64,
    pub dual_control_strict: bool,
    pub worker_addr: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bus_db_path", &self.bus_db_path)
            .field("approval_window_sec", &self.approval_window_sec)
            .field("breaker_threshold", &self.breaker_threshold)
            .field("breaker_window_sec", &self.breaker_window_sec)
            .field("chat_enabled", &self.chat_enabled)
            .field("chat_api_token", &self.chat_api_token.as_ref().map(|_| "<REDACTED>"))
            .field("chat_control_channel", &self.chat_control_channel)
            .field("chat_allowlist", &self.chat_allowlist)
            .field("chat_pin", &self.chat_pin.as_ref().map(|_| "<REDACTED>"))
            .field("chat_rate_limit_per_min", &self.chat_rate_limit_per_min)
            .field("chat_long_poll_sec", &self.chat_long_poll_sec)
            .field("dual_control_strict", &self.dual_control_strict)
            .field("worker_addr", &self.worker_addr)
            .finish()
    }
}

fn read_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn read_int(name: &str, default: i64) -> Result<i64> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<i64>()
            .map_err(|_| anyhow::anyhow!("config.invalid: {name}={v:?} is not an integer")),
        Err(_) => Ok(default),
    }
}

fn read_nonempty(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

impl Config {
    /// Load configuration from the process environment. Only
    /// `CHAT_ENABLED=1` with a missing `CHAT_API_TOKEN` is treated as
    /// `config.invalid` — every other key has a documented default.
    pub fn from_env() -> Result<Self> {
        let bus_db_path =
            read_nonempty(ENV_BUS_DB_PATH).unwrap_or_else(|| DEFAULT_BUS_DB_PATH.to_string());

        let approval_window_sec = read_int(ENV_APPROVAL_WINDOW_SEC, DEFAULT_APPROVAL_WINDOW_SEC)?;
        let breaker_threshold = read_int(ENV_BREAKER_THRESHOLD, DEFAULT_BREAKER_THRESHOLD)?;
        let breaker_window_sec = read_int(ENV_BREAKER_WINDOW_SEC, DEFAULT_BREAKER_WINDOW_SEC)?;
        let chat_enabled = read_bool(ENV_CHAT_ENABLED);
        let chat_api_token = read_nonempty(ENV_CHAT_API_TOKEN);
        let chat_control_channel = read_nonempty(ENV_CHAT_CONTROL_CHANNEL);
        let chat_allowlist = read_nonempty(ENV_CHAT_ALLOWLIST)
            .map(|csv| csv.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let chat_pin = read_nonempty(ENV_CHAT_PIN);
        let chat_rate_limit_per_min =
            read_int(ENV_CHAT_RATE_LIMIT_PER_MIN, DEFAULT_CHAT_RATE_LIMIT_PER_MIN)?;
        let chat_long_poll_sec = read_int(ENV_CHAT_LONG_POLL_SEC, DEFAULT_CHAT_LONG_POLL_SEC)?;
        let dual_control_strict = read_bool(ENV_DUAL_CONTROL_STRICT);
        let worker_addr = read_nonempty(ENV_WORKER_ADDR);

        if chat_enabled && chat_api_token.is_none() {
            bail!("config.invalid: CHAT_ENABLED=1 requires CHAT_API_TOKEN to be set");
        }

        Ok(Self {
            bus_db_path,
            approval_window_sec,
            breaker_threshold,
            breaker_window_sec,
            chat_enabled,
            chat_api_token,
            chat_control_channel,
            chat_allowlist,
            chat_pin,
            chat_rate_limit_per_min,
            chat_long_poll_sec,
            dual_control_strict,
            worker_addr,
        })
    }
}
