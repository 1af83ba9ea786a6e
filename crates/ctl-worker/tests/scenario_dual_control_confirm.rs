//! S2 — dual-control confirm, and S3 — duplicate-source rejection (spec §8).

use ctl_orders::NewTicket;
use ctl_schemas::{OrderState, OrderType, Side, Source};
use ctl_worker::{state::AppState, worker};

async fn test_state() -> (AppState, tempfile::TempDir, tempfile::TempDir) {
    let db_dir = tempfile::tempdir().unwrap();
    let db = ctl_db::connect(db_dir.path().join("ctl.db").to_str().unwrap())
        .await
        .unwrap();
    ctl_db::migrate(&db).await.unwrap();

    let orders_dir = tempfile::tempdir().unwrap();
    let orders = ctl_orders::OrderStore::open(orders_dir.path()).unwrap();

    let config = ctl_config::Config {
        bus_db_path: "unused".into(),
        approval_window_sec: 90,
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
async fn dual_control_confirm_then_duplicate_source_is_rejected() {
    let (state, _db_dir, _orders_dir) = test_state().await;

    let token_a = {
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
        serde_json::json!({ "token": token_a }),
        Source::Cli,
        None,
        None,
        Some("cli:1"),
    )
    .await
    .unwrap();
    assert!(worker::step(&state).await.unwrap());

    let events = ctl_db::tail_events(&state.db, 5, None).await.unwrap();
    assert!(events.iter().any(|e| e.message == "orders.confirm.pending"));
    {
        let orders = state.orders.lock().await;
        assert_eq!(orders.get(&token_a).unwrap().state, OrderState::Pending);
    }

    ctl_db::enqueue(
        &state.db,
        "orders.confirm",
        serde_json::json!({ "token": token_a }),
        Source::Chat,
        None,
        None,
        Some("chat:42"),
    )
    .await
    .unwrap();
    assert!(worker::step(&state).await.unwrap());

    let events = ctl_db::tail_events(&state.db, 1, None).await.unwrap();
    assert_eq!(events[0].message, "orders.confirm.ok");
    {
        let orders = state.orders.lock().await;
        assert_eq!(orders.get(&token_a).unwrap().state, OrderState::Confirmed);
    }
}

#[tokio::test]
async fn duplicate_source_before_fulfillment_is_rejected() {
    let (state, _db_dir, _orders_dir) = test_state().await;

    let token_b = {
        let mut orders = state.orders.lock().await;
        orders
            .create(NewTicket {
                symbol: "QQQ".into(),
                side: Side::Sell,
                qty: "5".into(),
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
        serde_json::json!({ "token": token_b }),
        Source::Cli,
        None,
        None,
        Some("cli:1"),
    )
    .await
    .unwrap();
    assert!(worker::step(&state).await.unwrap());

    ctl_db::enqueue(
        &state.db,
        "orders.confirm",
        serde_json::json!({ "token": token_b }),
        Source::Cli,
        None,
        None,
        Some("cli:2"),
    )
    .await
    .unwrap();
    assert!(worker::step(&state).await.unwrap());

    let events = ctl_db::tail_events(&state.db, 3, None).await.unwrap();
    assert!(events.iter().any(|e| e.message == "approval.duplicate_source"));
    {
        let orders = state.orders.lock().await;
        assert_eq!(orders.get(&token_b).unwrap().state, OrderState::Pending);
    }
}
