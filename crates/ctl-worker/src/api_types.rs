//! Wire types for the projection API (C7). No business logic lives here.

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub storage_reachable: bool,
    pub worker_heartbeat_age_sec: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ApprovalsSummary {
    pub count: i64,
    pub max_age_sec: i64,
}

#[derive(Debug, Serialize)]
pub struct Kpis {
    pub events_per_minute: i64,
    pub commands_done: i64,
    pub commands_error: i64,
}

#[derive(Debug, Serialize)]
pub struct OrderSummary {
    pub token: String,
    pub symbol: String,
    pub side: &'static str,
    pub state: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub mode: String,
    pub state: String,
    pub breaker_state: String,
    pub events: Vec<ctl_schemas::Event>,
    pub pending_approvals: ApprovalsSummary,
    pub orders: Vec<OrderSummary>,
    pub order_state_counts: std::collections::BTreeMap<&'static str, usize>,
    pub connection_health: &'static str,
    pub kpis: Kpis,
    pub build: crate::state::BuildInfo,
}
