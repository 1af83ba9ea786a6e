//! ctl-workerd entry point.
//!
//! Thin: loads configuration, opens the bus store and order store, spawns
//! the worker loop and heartbeat, and starts the projection API. All route
//! handlers live in `routes.rs`; all shared state lives in `state.rs`.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use ctl_worker::{routes, state, worker};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

const DEFAULT_ADDR: &str = "127.0.0.1:8899";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let config = ctl_config::Config::from_env().context("config.invalid")?;

    let db = ctl_db::connect(&config.bus_db_path).await?;
    ctl_db::migrate(&db).await?;

    let orders = ctl_orders::OrderStore::open("runtime/orders")
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("opening order store")?;

    let addr: SocketAddr = config
        .worker_addr
        .clone()
        .unwrap_or_else(|| DEFAULT_ADDR.to_string())
        .parse()
        .context("WORKER_ADDR is not a valid socket address")?;

    let shared = state::AppState::new(db.clone(), orders, config);

    state::spawn_heartbeat(shared.db.clone(), shared.bus.clone(), HEARTBEAT_INTERVAL);

    let worker_state = shared.clone();
    tokio::spawn(async move { worker::run(worker_state).await });

    let app = routes::build_router(shared).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    info!("ctl-workerd listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
