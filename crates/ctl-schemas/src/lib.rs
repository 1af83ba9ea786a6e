//! Shared DTOs for the control plane.
//!
//! Pure data types only — no I/O, no async. `ctl-db`, `ctl-orders`,
//! `ctl-worker`, `ctl-chat` and `ctl-cli` all depend on this crate so that
//! the wire shape of a command/event/ticket is defined exactly once.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cli,
    Chat,
    Supervisor,
    Test,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cli => "cli",
            Source::Chat => "chat",
            Source::Supervisor => "supervisor",
            Source::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cli" => Some(Source::Cli),
            "chat" => Some(Source::Chat),
            "supervisor" => Some(Source::Supervisor),
            "test" => Some(Source::Test),
            _ => None,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    New,
    Done,
    Error,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::New => "NEW",
            CommandStatus::Done => "DONE",
            CommandStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(CommandStatus::New),
            "DONE" => Some(CommandStatus::Done),
            "ERROR" => Some(CommandStatus::Error),
            _ => None,
        }
    }
}

/// A row from the `commands` table (spec.md §3 "Command").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub cmd_id: String,
    pub cmd: String,
    pub args: Value,
    pub source: Source,
    pub status: CommandStatus,
    pub dedupe_key: Option<String>,
    pub retry_count: i64,
    pub available_at: i64,
    pub ttl_sec: Option<i64>,
    pub created_at: i64,
    pub actor_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
    Ok,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Ok => "ok",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Level::Info),
            "warn" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "ok" => Some(Level::Ok),
            _ => None,
        }
    }
}

/// A row from the append-only `events` table (spec.md §3 "Event").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub ts: i64,
    pub level: Level,
    pub message: String,
    pub fields: Value,
}

// ---------------------------------------------------------------------------
// AppState (key/value)
// ---------------------------------------------------------------------------

/// Well-known `app_state` keys (spec.md §3 "AppState").
pub mod state_keys {
    pub const STATE: &str = "state";
    pub const MODE: &str = "mode";
    pub const BREAKER_STATE: &str = "breaker_state";
    pub const WORKER_START_TS: &str = "worker_start_ts";
    pub const WORKER_HEARTBEAT_TS: &str = "worker_heartbeat_ts";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Run,
    Paused,
    Stopped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Run => "RUN",
            RunState::Paused => "PAUSED",
            RunState::Stopped => "STOPPED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Live,
    Backtest,
    Replay,
    Control,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Paper => "paper",
            Mode::Live => "live",
            Mode::Backtest => "backtest",
            Mode::Replay => "replay",
            Mode::Control => "control",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paper" => Some(Mode::Paper),
            "live" => Some(Mode::Live),
            "backtest" => Some(Mode::Backtest),
            "replay" => Some(Mode::Replay),
            "control" => Some(Mode::Control),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Ok,
    Tripped,
    Killswitch,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Ok => "ok",
            BreakerState::Tripped => "tripped",
            BreakerState::Killswitch => "killswitch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(BreakerState::Ok),
            "tripped" => Some(BreakerState::Tripped),
            "killswitch" => Some(BreakerState::Killswitch),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    High,
    Critical,
}

/// Static policy for a command name (spec.md §4.2 "Control policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub risk: Risk,
    pub required_approvals: i64,
    pub approval_window_sec: i64,
}

/// A row from the `approvals` table (spec.md §3 "Approval").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub cmd_name: String,
    pub identity: String,
    pub required: i64,
    pub window_sec: i64,
    pub sources_seen: Vec<String>,
    pub actors_seen: Vec<String>,
    pub created_at: i64,
    pub fulfilled_at: Option<i64>,
    pub expired_at: Option<i64>,
}

impl Approval {
    pub fn is_terminal(&self) -> bool {
        self.fulfilled_at.is_some() || self.expired_at.is_some()
    }
}

/// Outcome of `ctl_db::offer_approval` (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApprovalDecision {
    Pending,
    Fulfilled,
    RejectedDuplicateSource,
    Expired,
}

/// Reserved identity for bulk, non-token-scoped approvals (`orders.confirm_all`).
pub const BULK_IDENTITY: &str = "__bulk__";

// ---------------------------------------------------------------------------
// OrderTicket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

/// Lifecycle states for an order ticket (spec.md §3 "OrderTicket", §4.4
/// transition table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    ConfirmedChat,
    Confirmed,
    Rejected,
    Canceled,
    Expired,
    Filled,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "PENDING",
            OrderState::ConfirmedChat => "CONFIRMED_CHAT",
            OrderState::Confirmed => "CONFIRMED",
            OrderState::Rejected => "REJECTED",
            OrderState::Canceled => "CANCELED",
            OrderState::Expired => "EXPIRED",
            OrderState::Filled => "FILLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Rejected | OrderState::Canceled | OrderState::Expired | OrderState::Filled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub id: String,
    pub token: String,
    pub symbol: String,
    pub side: Side,
    pub qty: String,
    pub r#type: OrderType,
    pub limit_price: Option<String>,
    pub stop_price: Option<String>,
    pub state: OrderState,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    /// `source -> actor_id` of the most recent actor to touch this ticket
    /// from each source (spec.md §3: `last_actor_by_source`).
    pub last_actor_by_source: std::collections::BTreeMap<String, String>,
}
