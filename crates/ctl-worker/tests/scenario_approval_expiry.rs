//! S4 — approval expiry (spec §8): a lone approval that never gets its
//! second distinct source expires once `window_sec` elapses, and the
//! ticket it targeted is left `PENDING`, not transitioned.

use ctl_orders::NewTicket;
use ctl_schemas::{OrderState, OrderType, Side, Source};
use ctl_worker::{state::AppState, worker};

async fn test_state(approval_window_sec: i64) -> (AppState, tempfile::TempDir, tempfile::TempDir) {
    let db_dir = tempfile::tempdir().unwrap();
    let db = ctl_db::connect(db_dir.path().join("ctl.db").to_str().unwrap())
        .await
        .unwrap();
    ctl_db::migrate(&db).await.unwrap();

    let orders_dir = tempfile::tempdir().unwrap();
    let orders = ctl_orders::OrderStore::open(orders_dir.path()).unwrap();

    let config = ctl_config::Config {
        bus_db_path: "unused".into(),
        approval_window_sec,
        breaker_threshold: 5,
        breaker_window_sec: 60,
        chat_enabled: false,
        chat_api_token: None,
        chat_control_channel: None,
        chat_allowlist: vec![],
        chat_pin: None,
        chat_rate_limit_per_min: 10,
        chat_long_poll_sec: 25,
        dual_control_strict: false,
        worker_addr: None,
    };

    let state = AppState::new(db, orders, config);
    (state, db_dir, orders_dir)
}

#[tokio::test]
async fn lone_approval_expires_and_ticket_stays_pending() {
    let (state, _db_dir, _orders_dir) = test_state(1).await;

    let token = {
        let mut orders = state.orders.lock().await;
        orders
            .create(NewTicket {
                symbol: "SPY".into(),
                side: Side::Buy,
                qty: "10".into(),
                r#type: OrderType::Market,
                limit_price: None,
                stop_price: None,
                expires_at: None,
            })
            .token
    };

    ctl_db::enqueue(
        &state.db,
        "orders.confirm",
        serde_json::json!({ "token": token }),
        Source::Cli,
        None,
        None,
        Some("cli:1"),
    )
    .await
    .unwrap();
    assert!(worker::step(&state).await.unwrap());

    let events = ctl_db::tail_events(&state.db, 1, None).await.unwrap();
    assert_eq!(events[0].message, "orders.confirm.pending");
    {
        let orders = state.orders.lock().await;
        assert_eq!(orders.get(&token).unwrap().state, OrderState::Pending);
    }

    // Let the 1-second approval window lapse with no second offer at all.
    // The queue is empty, so this step only sweeps expired approvals; the
    // sweep must still fire and emit `approval.expired` before `step`
    // returns `Ok(false)` for the empty queue.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    assert!(!worker::step(&state).await.unwrap());

    let events = ctl_db::tail_events(&state.db, 1, None).await.unwrap();
    assert_eq!(events[0].message, "approval.expired");
    {
        let orders = state.orders.lock().await;
        assert_eq!(orders.get(&token).unwrap().state, OrderState::Pending);
    }
}
