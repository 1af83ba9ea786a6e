//! Shared runtime state for `ctl-workerd`: the bus pool, the order store,
//! configuration, the circuit breaker, and the SSE broadcast bus.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ctl_config::Config;
use ctl_orders::OrderStore;
use ctl_schemas::{state_keys, Event};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex};

use crate::breaker::Breaker;

/// Messages broadcast over the internal bus and surfaced as SSE events on
/// `GET /v1/stream`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    BusEvent(Event),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (`Arc`) handle shared across the worker loop and every Axum
/// handler. The worker loop is the sole mutator of `db`/`orders`/`breaker`;
/// HTTP handlers only read.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub orders: Arc<Mutex<OrderStore>>,
    pub config: Config,
    pub breaker: Arc<Mutex<Breaker>>,
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    last_broadcast_event_id: Arc<AtomicI64>,
}

impl AppState {
    pub fn new(db: SqlitePool, orders: OrderStore, config: Config) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        let breaker = Breaker::new(config.breaker_threshold, config.breaker_window_sec);

        Self {
            db,
            orders: Arc::new(Mutex::new(orders)),
            config,
            breaker: Arc::new(Mutex::new(breaker)),
            bus,
            build: BuildInfo {
                service: "ctl-workerd",
                version: env!("CARGO_PKG_VERSION"),
            },
            last_broadcast_event_id: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Publish every `events` row appended since the last call onto `bus` as
    /// `BusMsg::BusEvent`, in order. Called once per `ctl_worker::worker::step`
    /// so `/v1/stream` mirrors everything `tail_events` would show — not just
    /// heartbeats — including events emitted from inside `ctl-db` itself
    /// (`approval.pending`, `approval.expired`, ...) that no handler call site
    /// sees directly.
    pub async fn broadcast_new_events(&self) -> anyhow::Result<()> {
        let since = self.last_broadcast_event_id.load(Ordering::Relaxed);
        let events = ctl_db::tail_events(&self.db, 1000, Some(since)).await?;
        if let Some(last) = events.last() {
            self.last_broadcast_event_id.store(last.id, Ordering::Relaxed);
        }
        for event in events {
            let _ = self.bus.send(BusMsg::BusEvent(event));
        }
        Ok(())
    }
}

/// Stamp `worker_start_ts` once at boot and refresh a heartbeat key on an
/// interval (spec §11 "deadman-style worker heartbeat"); `ctl health` and the
/// projection snapshot both read it back.
pub fn spawn_heartbeat(db: SqlitePool, bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let boot_ts = chrono::Utc::now().timestamp();
        let _ = ctl_db::set_state(&db, state_keys::WORKER_START_TS, &boot_ts.to_string()).await;

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now();
            let _ = ctl_db::set_state(
                &db,
                state_keys::WORKER_HEARTBEAT_TS,
                &now.timestamp().to_string(),
            )
            .await;
            let _ = bus.send(BusMsg::Heartbeat {
                ts_millis: now.timestamp_millis(),
            });
        }
    });
}
