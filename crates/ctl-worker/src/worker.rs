//! The worker loop (C5): dequeue -> classify -> handle -> mark terminal ->
//! emit. Cooperative single-consumer; the loop itself never blocks on
//! network I/O, only on the local store.

use std::time::Duration;

use chrono::Utc;
use ctl_schemas::{state_keys, BreakerState, Command, Level};
use serde_json::json;

use crate::handlers::{self, HandlerError};
use crate::state::AppState;

const IDLE_POLL: Duration = Duration::from_millis(200);

/// Run forever. Each iteration processes at most one command; an empty
/// queue (or a tripped breaker holding the head command) backs off briefly
/// rather than busy-looping.
pub async fn run(state: AppState) {
    loop {
        match step(&state).await {
            Ok(true) => continue,
            Ok(false) => tokio::time::sleep(IDLE_POLL).await,
            Err(err) => {
                tracing::error!(error = %err, "worker step failed");
                tokio::time::sleep(IDLE_POLL).await;
            }
        }
    }
}

/// Returns `Ok(true)` if a command was dequeued and disposed of (terminal or
/// left NEW because the breaker is tripped and it isn't `state.resume`),
/// `Ok(false)` if the queue was empty. Exposed for scenario tests that want
/// deterministic single-step control instead of the free-running loop.
pub async fn step(state: &AppState) -> anyhow::Result<bool> {
    // Run first so a lone approval that never gets a second offer still
    // expires passively on an otherwise-idle iteration (spec §8 S4).
    ctl_db::sweep_expired_approvals(&state.db).await?;

    let breaker_state = ctl_db::get_state(&state.db, state_keys::BREAKER_STATE)
        .await?
        .and_then(|v| BreakerState::parse(&v))
        .unwrap_or(BreakerState::Ok);

    // While tripped, only a queued `state.resume` may run (out of FIFO
    // order if necessary); every other NEW row is left untouched (testable
    // property 6).
    let cmd = if breaker_state == BreakerState::Tripped {
        match ctl_db::next_new_matching(&state.db, "state.resume").await? {
            Some(cmd) => cmd,
            None => {
                state.broadcast_new_events().await?;
                return Ok(false);
            }
        }
    } else {
        match ctl_db::next_new(&state.db).await? {
            Some(cmd) => cmd,
            None => {
                state.broadcast_new_events().await?;
                return Ok(false);
            }
        }
    };

    tracing::info!(cmd_id = %cmd.cmd_id, cmd = %cmd.cmd, source = %cmd.source, "dispatching command");
    dispose(state, cmd).await?;
    state.broadcast_new_events().await?;
    Ok(true)
}

async fn dispose(state: &AppState, cmd: Command) -> anyhow::Result<()> {
    let cmd_id = cmd.cmd_id.clone();

    let spawned = {
        let state = state.clone();
        let cmd = cmd.clone();
        tokio::spawn(async move { handlers::dispatch(&state, &cmd).await })
    };

    match spawned.await {
        Ok(Ok(())) => {
            ctl_db::mark_done(&state.db, &cmd_id).await?;
        }
        Ok(Err(HandlerError::Rejected(reason))) => {
            ctl_db::mark_error(&state.db, &cmd_id, &reason).await?;
            ctl_db::emit(
                &state.db,
                Level::Warn,
                "command.rejected",
                json!({ "cmd_id": cmd_id, "cmd": cmd.cmd, "reason": reason }),
            )
            .await?;
        }
        Ok(Err(HandlerError::Unexpected(err))) => {
            record_unexpected_failure(state, &cmd_id, &cmd.cmd, &err.to_string()).await?;
        }
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                "handler panicked".to_string()
            } else {
                join_err.to_string()
            };
            record_unexpected_failure(state, &cmd_id, &cmd.cmd, &reason).await?;
        }
    }

    Ok(())
}

async fn record_unexpected_failure(
    state: &AppState,
    cmd_id: &str,
    cmd_name: &str,
    reason: &str,
) -> anyhow::Result<()> {
    ctl_db::mark_error(&state.db, cmd_id, "handler.unexpected").await?;
    ctl_db::emit(
        &state.db,
        Level::Error,
        "handler.unexpected",
        json!({ "cmd_id": cmd_id, "cmd": cmd_name, "reason": reason }),
    )
    .await?;

    let now = Utc::now().timestamp();
    let tripped = {
        let mut breaker = state.breaker.lock().await;
        let tripped = breaker.record_failure(now);
        (tripped, breaker.recent_failures(now))
    };

    if tripped.0 {
        ctl_db::set_state(
            &state.db,
            state_keys::BREAKER_STATE,
            BreakerState::Tripped.as_str(),
        )
        .await?;
        ctl_db::set_state(
            &state.db,
            state_keys::STATE,
            ctl_schemas::RunState::Paused.as_str(),
        )
        .await?;
        ctl_db::emit(
            &state.db,
            Level::Error,
            "breaker.tripped",
            json!({ "recent_errors": tripped.1 }),
        )
        .await?;
    }

    Ok(())
}
