//! S5 — kill-switch (spec §8).

use ctl_orders::NewTicket;
use ctl_schemas::{state_keys, OrderState, OrderType, Side, Source};
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
async fn stop_now_pauses_and_cancels_every_pending_ticket() {
    let (state, _db_dir, _orders_dir) = test_state().await;

    let mut tokens = Vec::new();
    {
        let mut orders = state.orders.lock().await;
        for symbol in ["SPY", "QQQ", "IWM"] {
            tokens.push(
                orders
                    .create(NewTicket {
                        symbol: symbol.into(),
                        side: Side::Buy,
                        qty: "1".into(),
                        r#type: OrderType::Market,
                        limit_price: None,
                        stop_price: None,
                        expires_at: None,
                    })
                    .token,
            );
        }
    }

    ctl_db::enqueue(
        &state.db,
        "stop.now",
        serde_json::json!({}),
        Source::Cli,
        None,
        None,
        Some("cli:1"),
    )
    .await
    .unwrap();

    assert!(worker::step(&state).await.unwrap());

    assert_eq!(
        ctl_db::get_state(&state.db, state_keys::STATE).await.unwrap().as_deref(),
        Some("PAUSED")
    );
    assert_eq!(
        ctl_db::get_state(&state.db, state_keys::BREAKER_STATE)
            .await
            .unwrap()
            .as_deref(),
        Some("killswitch")
    );

    {
        let orders = state.orders.lock().await;
        for token in &tokens {
            assert_eq!(orders.get(token).unwrap().state, OrderState::Canceled);
        }
    }

    let events = ctl_db::tail_events(&state.db, 10, None).await.unwrap();
    let stop_now_events = events.iter().filter(|e| e.message == "stop.now").count();
    assert_eq!(stop_now_events, 1);
}
