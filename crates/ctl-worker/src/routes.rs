//! The read-only projection API (C7), served over HTTP the way the
//! teacher's `mqk-daemon` serves `/v1/status` and an SSE `/v1/stream`.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use ctl_schemas::state_keys;
use futures_util::stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tower_http::cors::CorsLayer;

use crate::api_types::{ApprovalsSummary, HealthResponse, Kpis, OrderSummary, StatusResponse};
use crate::state::AppState;

const DEFAULT_EVENT_TAIL: i64 = 200;
const HEARTBEAT_STALE_SEC: i64 = 10;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/stream", get(stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let storage_reachable = ctl_db::get_state(&state.db, state_keys::STATE).await.is_ok();

    let heartbeat_age = ctl_db::get_state(&state.db, state_keys::WORKER_HEARTBEAT_TS)
        .await
        .ok()
        .flatten()
        .and_then(|v| v.parse::<i64>().ok())
        .map(|ts| Utc::now().timestamp() - ts);

    let heartbeat_ok = heartbeat_age.map(|age| age <= HEARTBEAT_STALE_SEC).unwrap_or(false);
    let ok = storage_reachable && heartbeat_ok;

    let body = HealthResponse {
        ok,
        storage_reachable,
        worker_heartbeat_age_sec: heartbeat_age,
    };

    let status = if ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(body))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    match build_status(&state).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "status snapshot failed");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn build_status(state: &AppState) -> anyhow::Result<StatusResponse> {
    let mode = ctl_db::get_state(&state.db, state_keys::MODE)
        .await?
        .unwrap_or_else(|| "control".to_string());
    let run_state = ctl_db::get_state(&state.db, state_keys::STATE)
        .await?
        .unwrap_or_else(|| "RUN".to_string());
    let breaker_state = ctl_db::get_state(&state.db, state_keys::BREAKER_STATE)
        .await?
        .unwrap_or_else(|| "ok".to_string());

    let events = ctl_db::tail_events(&state.db, DEFAULT_EVENT_TAIL, None).await?;
    let (approvals_count, approvals_max_age) = ctl_db::pending_approvals_summary(&state.db).await?;
    let (commands_done, commands_error) = ctl_db::command_outcome_counts(&state.db).await?;
    let events_per_minute = ctl_db::events_per_minute(&state.db).await?;

    let (orders, order_state_counts) = {
        let store = state.orders.lock().await;
        let orders: Vec<OrderSummary> = store
            .list()
            .map(|t| OrderSummary {
                token: t.token.clone(),
                symbol: t.symbol.clone(),
                side: t.side.as_str(),
                state: t.state.as_str(),
            })
            .collect();
        (orders, store.state_counts())
    };

    Ok(StatusResponse {
        mode,
        state: run_state,
        breaker_state,
        events,
        pending_approvals: ApprovalsSummary {
            count: approvals_count,
            max_age_sec: approvals_max_age,
        },
        orders,
        order_state_counts,
        connection_health: "n/a",
        kpis: Kpis {
            events_per_minute,
            commands_done,
            commands_error,
        },
        build: state.build.clone(),
    })
}

/// SSE wrapper over the internal broadcast bus (heartbeats + worker-emitted
/// events), reusing the teacher's `broadcast_to_sse` pattern.
async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(msg) => serde_json::to_string(&msg)
            .ok()
            .map(|payload| Ok(SseEvent::default().data(payload))),
        Err(_lagged) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
