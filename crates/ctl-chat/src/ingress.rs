//! Core message-handling pipeline (spec §4.5), separated from the teloxide
//! transport so it can be driven directly in tests without a live bot.

use ctl_policy::classify;
use ctl_schemas::{Level, Risk, Source};
use serde_json::json;

use crate::parse::{ParsedCommand, ParsedMessage};
use crate::state::ChatState;

/// User-facing result of handling one incoming message or button press. The
/// transport layer turns this into a reply or a callback answer.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Enqueued { cmd_id: String },
    PinAccepted,
    AuthDenied,
    PinRequired,
    RateLimited,
    Unrecognized,
}

/// Handle one incoming message from `user_id`. `now` is the current unix
/// timestamp, threaded in so the rate limiter and PIN session are
/// deterministic in tests.
pub async fn handle_message(
    state: &mut ChatState,
    user_id: &str,
    text: &str,
    now: i64,
) -> anyhow::Result<Outcome> {
    dispatch(state, user_id, crate::parse::parse_text(text), now).await
}

/// Handle one inline-button callback from `user_id`.
pub async fn handle_button(
    state: &mut ChatState,
    user_id: &str,
    payload: &str,
    now: i64,
) -> anyhow::Result<Outcome> {
    dispatch(state, user_id, crate::parse::parse_button_payload(payload), now).await
}

async fn dispatch(
    state: &mut ChatState,
    user_id: &str,
    parsed: ParsedMessage,
    now: i64,
) -> anyhow::Result<Outcome> {
    if !state.is_allowlisted(user_id) {
        ctl_db::emit(
            &state.db,
            Level::Warn,
            "auth.denied",
            json!({ "user_id": user_id, "reason": "not_allowlisted" }),
        )
        .await?;
        return Ok(Outcome::AuthDenied);
    }

    if !state.rate_limiter.allow(user_id, now) {
        if state.rate_limiter.should_emit_rate_limited(user_id, now) {
            ctl_db::emit(
                &state.db,
                Level::Warn,
                "rate.limited",
                json!({ "user_id": user_id }),
            )
            .await?;
        }
        return Ok(Outcome::RateLimited);
    }

    match parsed {
        ParsedMessage::Pin(secret) => {
            let matches = state
                .config
                .chat_pin
                .as_deref()
                .map(|configured| configured == secret)
                .unwrap_or(false);
            if matches {
                state.pin_sessions.authenticate(user_id, now);
                Ok(Outcome::PinAccepted)
            } else {
                Ok(Outcome::AuthDenied)
            }
        }
        ParsedMessage::Unrecognized => Ok(Outcome::Unrecognized),
        ParsedMessage::Command(cmd) => enqueue_command(state, user_id, cmd, now).await,
    }
}

async fn enqueue_command(
    state: &mut ChatState,
    user_id: &str,
    cmd: ParsedCommand,
    now: i64,
) -> anyhow::Result<Outcome> {
    let policy = classify(&cmd.cmd);

    if matches!(policy.risk, Risk::High | Risk::Critical) && !state.pin_sessions.is_valid(user_id, now)
    {
        ctl_db::emit(
            &state.db,
            Level::Warn,
            "auth.pin.required",
            json!({ "user_id": user_id, "cmd": cmd.cmd }),
        )
        .await?;
        return Ok(Outcome::PinRequired);
    }

    let dedupe_key = if matches!(policy.risk, Risk::High | Risk::Critical) {
        let identity = cmd.identity.as_deref().unwrap_or(ctl_schemas::BULK_IDENTITY);
        Some(format!("{}:{}", cmd.cmd, identity))
    } else {
        None
    };

    let actor_id = format!("chat:{user_id}");
    let cmd_id = ctl_db::enqueue(
        &state.db,
        &cmd.cmd,
        cmd.args,
        Source::Chat,
        None,
        dedupe_key.as_deref(),
        Some(&actor_id),
    )
    .await?;

    Ok(Outcome::Enqueued { cmd_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctl_schemas::state_keys;

    async fn test_state(allowlist: Vec<String>, pin: Option<String>) -> (ChatState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = ctl_db::connect(dir.path().join("ctl.db").to_str().unwrap())
            .await
            .unwrap();
        ctl_db::migrate(&db).await.unwrap();

        let config = ctl_config::Config {
            bus_db_path: "unused".into(),
            approval_window_sec: 90,
            breaker_threshold: 5,
            breaker_window_sec: 60,
            chat_enabled: true,
            chat_api_token: Some("token".into()),
            chat_control_channel: None,
            chat_allowlist: allowlist,
            chat_pin: pin,
            chat_rate_limit_per_min: 10,
            chat_long_poll_sec: 25,
            dual_control_strict: false,
            worker_addr: None,
        };

        (ChatState::new(db, config), dir)
    }

    #[tokio::test]
    async fn unallowlisted_user_is_denied() {
        let (mut state, _dir) = test_state(vec![], None).await;
        let outcome = handle_message(&mut state, "u1", "/pause", 0).await.unwrap();
        assert_eq!(outcome, Outcome::AuthDenied);
    }

    #[tokio::test]
    async fn low_risk_command_enqueues_without_pin() {
        let (mut state, _dir) = test_state(vec!["u1".into()], None).await;
        let outcome = handle_message(&mut state, "u1", "/pause", 0).await.unwrap();
        assert!(matches!(outcome, Outcome::Enqueued { .. }));

        let value = ctl_db::get_state(&state.db, state_keys::STATE).await.unwrap();
        assert_eq!(value, None); // enqueue only, worker not run here
    }

    #[tokio::test]
    async fn high_risk_command_requires_pin_session() {
        let (mut state, _dir) = test_state(vec!["u1".into()], Some("1234".into())).await;
        let outcome = handle_message(&mut state, "u1", "/confirm ABC123", 0).await.unwrap();
        assert_eq!(outcome, Outcome::PinRequired);

        let outcome = handle_message(&mut state, "u1", "/pin 1234", 0).await.unwrap();
        assert_eq!(outcome, Outcome::PinAccepted);

        let outcome = handle_message(&mut state, "u1", "/confirm ABC123", 10).await.unwrap();
        assert!(matches!(outcome, Outcome::Enqueued { .. }));
    }

    #[tokio::test]
    async fn wrong_pin_is_denied() {
        let (mut state, _dir) = test_state(vec!["u1".into()], Some("1234".into())).await;
        let outcome = handle_message(&mut state, "u1", "/pin 0000", 0).await.unwrap();
        assert_eq!(outcome, Outcome::AuthDenied);
    }

    #[tokio::test]
    async fn rate_limit_drops_excess_messages() {
        let (mut state, _dir) = test_state(vec!["u1".into()], None).await;
        state.rate_limiter = crate::rate_limit::RateLimiter::new(1, 60);

        let first = handle_message(&mut state, "u1", "/pause", 0).await.unwrap();
        assert!(matches!(first, Outcome::Enqueued { .. }));

        let second = handle_message(&mut state, "u1", "/resume", 1).await.unwrap();
        assert_eq!(second, Outcome::RateLimited);
    }

    #[tokio::test]
    async fn duplicate_button_presses_collapse_via_dedupe() {
        let (mut state, _dir) = test_state(vec!["u1".into()], Some("1234".into())).await;
        handle_message(&mut state, "u1", "/pin 1234", 0).await.unwrap();

        let first = handle_button(&mut state, "u1", "action:orders.confirm|identity:ABC123", 1)
            .await
            .unwrap();
        let second = handle_button(&mut state, "u1", "action:orders.confirm|identity:ABC123", 2)
            .await
            .unwrap();

        match (first, second) {
            (Outcome::Enqueued { cmd_id: a }, Outcome::Enqueued { cmd_id: b }) => {
                assert_eq!(a, b);
            }
            other => panic!("expected both to enqueue to the same cmd_id: {other:?}"),
        }
    }
}
