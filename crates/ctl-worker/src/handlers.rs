//! Per-command handler contracts (spec §4.4). Each handler is pure
//! store-bound logic: it never performs network I/O, and it returns an
//! explicit [`HandlerError`] instead of raising — only a genuine I/O failure
//! reaches [`HandlerError::Unexpected`] and counts toward the circuit
//! breaker; a known business rejection (unknown token, illegal transition,
//! bad args) is [`HandlerError::Rejected`] and never does.

use ctl_orders::{OrderStoreError, TicketEvent};
use ctl_policy::classify;
use ctl_schemas::{
    ApprovalDecision, Command, Level, Mode, RunState, Source, BULK_IDENTITY,
};
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Debug)]
pub enum HandlerError {
    /// A known-business rejection: never trips the breaker.
    Rejected(String),
    /// An unexpected failure (I/O, corrupt state): trips the breaker.
    Unexpected(anyhow::Error),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Rejected(reason) => write!(f, "rejected: {reason}"),
            HandlerError::Unexpected(err) => write!(f, "unexpected: {err}"),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Unexpected(err)
    }
}

impl From<OrderStoreError> for HandlerError {
    fn from(err: OrderStoreError) -> Self {
        match &err {
            OrderStoreError::UnknownToken(token) => {
                HandlerError::Rejected(format!("unknown_token:{token}"))
            }
            OrderStoreError::Transition(e) => HandlerError::Rejected(e.to_string()),
            OrderStoreError::Io(_) | OrderStoreError::Corrupt(_) | OrderStoreError::Audit(_) => {
                HandlerError::Unexpected(anyhow::anyhow!(err.to_string()))
            }
        }
    }
}

fn arg_str(args: &Value, key: &str) -> Result<String, HandlerError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerError::Rejected(format!("args_invalid: missing {key}")))
}

/// Route a dequeued command to its handler. Unrecognized command names
/// (including `live.cancel`, carried in the policy table but unimplemented —
/// see DESIGN.md) are rejected as `policy.denied`, never trip the breaker.
pub async fn dispatch(state: &AppState, cmd: &Command) -> Result<(), HandlerError> {
    match cmd.cmd.as_str() {
        "state.pause" => state_pause(state).await,
        "state.resume" => state_resume(state).await,
        "state.stop" => state_stop(state).await,
        "mode.switch" => mode_switch(state, &cmd.args).await,
        "orders.confirm" => orders_confirm(state, cmd).await,
        "orders.reject" => orders_reject(state, cmd).await,
        "orders.confirm_all" => orders_confirm_all(state, cmd).await,
        "orders.cancel" => orders_cancel(state, cmd).await,
        "stop.now" => stop_now(state, cmd).await,
        // Fault-injection hook named explicitly in spec §8's breaker scenario
        // (S6): always an unexpected failure, so it exercises the breaker
        // without a real handler bug.
        "test.explode" => Err(HandlerError::Unexpected(anyhow::anyhow!(
            "test.explode always fails"
        ))),
        other => Err(HandlerError::Rejected(format!(
            "policy.denied: no handler for {other}"
        ))),
    }
}

async fn state_pause(state: &AppState) -> Result<(), HandlerError> {
    ctl_db::set_state(&state.db, ctl_schemas::state_keys::STATE, RunState::Paused.as_str())
        .await?;
    ctl_db::emit(
        &state.db,
        Level::Info,
        "state.changed",
        json!({ "state": RunState::Paused.as_str() }),
    )
    .await?;
    Ok(())
}

async fn state_resume(state: &AppState) -> Result<(), HandlerError> {
    ctl_db::set_state(&state.db, ctl_schemas::state_keys::STATE, RunState::Run.as_str())
        .await?;

    let was_tripped = ctl_db::get_state(&state.db, ctl_schemas::state_keys::BREAKER_STATE)
        .await?
        .map(|v| v != ctl_schemas::BreakerState::Ok.as_str())
        .unwrap_or(false);

    if was_tripped {
        state.breaker.lock().await.reset();
        ctl_db::set_state(
            &state.db,
            ctl_schemas::state_keys::BREAKER_STATE,
            ctl_schemas::BreakerState::Ok.as_str(),
        )
        .await?;
        ctl_db::emit(&state.db, Level::Ok, "breaker.reset", json!({})).await?;
    }

    ctl_db::emit(
        &state.db,
        Level::Info,
        "state.changed",
        json!({ "state": RunState::Run.as_str() }),
    )
    .await?;
    Ok(())
}

async fn state_stop(state: &AppState) -> Result<(), HandlerError> {
    ctl_db::set_state(&state.db, ctl_schemas::state_keys::STATE, RunState::Stopped.as_str())
        .await?;
    ctl_db::emit(
        &state.db,
        Level::Info,
        "state.changed",
        json!({ "state": RunState::Stopped.as_str() }),
    )
    .await?;
    Ok(())
}

async fn mode_switch(state: &AppState, args: &Value) -> Result<(), HandlerError> {
    let target_str = arg_str(args, "target")?;
    let target = Mode::parse(&target_str)
        .ok_or_else(|| HandlerError::Rejected(format!("args_invalid: unknown mode {target_str}")))?;

    ctl_db::set_state(&state.db, ctl_schemas::state_keys::MODE, target.as_str()).await?;
    ctl_db::emit(
        &state.db,
        Level::Info,
        "mode.changed",
        json!({ "mode": target.as_str() }),
    )
    .await?;
    Ok(())
}

/// Shared confirm/reject/cancel approval plumbing: looks up the ticket,
/// offers the approval, and returns the decision plus the approval row for
/// the caller to act on. `unknown_event` names the `*.unknown` event emitted
/// when the token does not resolve to a live ticket.
async fn offer_ticket_approval(
    state: &AppState,
    cmd: &Command,
    token: &str,
    unknown_event: &str,
) -> Result<(ApprovalDecision, ctl_schemas::Approval), HandlerError> {
    {
        let orders = state.orders.lock().await;
        let ticket = orders
            .get(token)
            .ok_or_else(|| OrderStoreError::UnknownToken(token.to_string()))?;
        if ticket.state.is_terminal() {
            drop(orders);
            ctl_db::emit(
                &state.db,
                Level::Warn,
                unknown_event,
                json!({ "token": token, "reason": "terminal" }),
            )
            .await?;
            return Err(HandlerError::Rejected(format!("unknown_token:{token}")));
        }
    }

    let policy = classify(&cmd.cmd);
    let source = cmd.source;
    let actor_id = cmd.actor_id.clone().unwrap_or_else(|| source.to_string());

    let (decision, approval) = ctl_db::offer_approval(
        &state.db,
        &cmd.cmd,
        token,
        source,
        &actor_id,
        policy.required_approvals,
        policy.approval_window_sec,
        state.config.dual_control_strict,
    )
    .await?;

    Ok((decision, approval))
}

async fn orders_confirm(state: &AppState, cmd: &Command) -> Result<(), HandlerError> {
    let token = arg_str(&cmd.args, "token")?;

    let (decision, approval) = offer_ticket_approval(state, cmd, &token, "orders.confirm.unknown").await?;

    match decision {
        ApprovalDecision::Pending => {
            ctl_db::emit(
                &state.db,
                Level::Info,
                "orders.confirm.pending",
                json!({ "token": token, "sources": approval.sources_seen }),
            )
            .await?;
            if cmd.source == Source::Chat {
                let mut orders = state.orders.lock().await;
                orders.apply(&token, TicketEvent::ConfirmChat, "chat", &approval_actor(&approval), None)?;
            }
        }
        ApprovalDecision::RejectedDuplicateSource => {}
        ApprovalDecision::Expired => {}
        ApprovalDecision::Fulfilled => {
            {
                let mut orders = state.orders.lock().await;
                orders.apply(
                    &token,
                    TicketEvent::ConfirmDual,
                    cmd.source.as_str(),
                    &cmd.actor_id.clone().unwrap_or_default(),
                    Some(&cmd.cmd_id),
                )?;
            }
            ctl_db::emit(
                &state.db,
                Level::Ok,
                "orders.confirm.ok",
                json!({ "token": token, "sources": approval.sources_seen }),
            )
            .await?;
        }
    }

    Ok(())
}

fn approval_actor(approval: &ctl_schemas::Approval) -> String {
    approval
        .actors_seen
        .last()
        .cloned()
        .unwrap_or_else(|| "chat:unknown".to_string())
}

async fn orders_reject(state: &AppState, cmd: &Command) -> Result<(), HandlerError> {
    let token = arg_str(&cmd.args, "token")?;

    let (decision, approval) = offer_ticket_approval(state, cmd, &token, "orders.reject.unknown").await?;

    match decision {
        ApprovalDecision::Fulfilled => {
            {
                let mut orders = state.orders.lock().await;
                orders.apply(
                    &token,
                    TicketEvent::Reject,
                    cmd.source.as_str(),
                    &cmd.actor_id.clone().unwrap_or_default(),
                    Some(&cmd.cmd_id),
                )?;
            }
            ctl_db::emit(
                &state.db,
                Level::Ok,
                "orders.reject.ok",
                json!({ "token": token, "sources": approval.sources_seen }),
            )
            .await?;
        }
        ApprovalDecision::Pending => {
            ctl_db::emit(
                &state.db,
                Level::Info,
                "orders.reject.pending",
                json!({ "token": token, "sources": approval.sources_seen }),
            )
            .await?;
        }
        ApprovalDecision::RejectedDuplicateSource | ApprovalDecision::Expired => {}
    }

    Ok(())
}

async fn orders_cancel(state: &AppState, cmd: &Command) -> Result<(), HandlerError> {
    let token = arg_str(&cmd.args, "token")?;

    let (decision, approval) = offer_ticket_approval(state, cmd, &token, "orders.cancel.unknown").await?;

    match decision {
        ApprovalDecision::Fulfilled => {
            {
                let mut orders = state.orders.lock().await;
                orders.apply(
                    &token,
                    TicketEvent::Cancel {
                        reason: "operator".to_string(),
                    },
                    cmd.source.as_str(),
                    &cmd.actor_id.clone().unwrap_or_default(),
                    Some(&cmd.cmd_id),
                )?;
            }
            ctl_db::emit(
                &state.db,
                Level::Ok,
                "orders.cancel.ok",
                json!({ "token": token, "sources": approval.sources_seen }),
            )
            .await?;
        }
        ApprovalDecision::Pending => {
            ctl_db::emit(
                &state.db,
                Level::Info,
                "orders.cancel.pending",
                json!({ "token": token, "sources": approval.sources_seen }),
            )
            .await?;
        }
        ApprovalDecision::RejectedDuplicateSource | ApprovalDecision::Expired => {}
    }

    Ok(())
}

/// Open question resolution (spec §9): implemented as a single bulk
/// approval rather than one per token — see DESIGN.md.
async fn orders_confirm_all(state: &AppState, cmd: &Command) -> Result<(), HandlerError> {
    let policy = classify(&cmd.cmd);
    let source = cmd.source;
    let actor_id = cmd.actor_id.clone().unwrap_or_else(|| source.to_string());

    let (decision, approval) = ctl_db::offer_approval(
        &state.db,
        &cmd.cmd,
        BULK_IDENTITY,
        source,
        &actor_id,
        policy.required_approvals,
        policy.approval_window_sec,
        state.config.dual_control_strict,
    )
    .await?;

    match decision {
        ApprovalDecision::Pending => {
            ctl_db::emit(
                &state.db,
                Level::Info,
                "orders.confirm_all.pending",
                json!({ "sources": approval.sources_seen }),
            )
            .await?;
        }
        ApprovalDecision::Fulfilled => {
            let tokens = {
                let orders = state.orders.lock().await;
                orders.pending_tokens()
            };
            for token in tokens {
                let mut orders = state.orders.lock().await;
                if orders
                    .apply(
                        &token,
                        TicketEvent::ConfirmDual,
                        cmd.source.as_str(),
                        &actor_id,
                        None,
                    )
                    .is_ok()
                {
                    drop(orders);
                    ctl_db::emit(
                        &state.db,
                        Level::Ok,
                        "orders.confirm.ok",
                        json!({ "token": token, "sources": approval.sources_seen }),
                    )
                    .await?;
                }
            }
        }
        ApprovalDecision::RejectedDuplicateSource | ApprovalDecision::Expired => {}
    }

    Ok(())
}

/// Critical kill-switch. Bypasses the approval ledger (policy requires a
/// single approval, and `requires_approval_ledger` only gates HIGH risk).
/// Idempotent: if the breaker is already `killswitch`, does nothing further.
async fn stop_now(state: &AppState, _cmd: &Command) -> Result<(), HandlerError> {
    let already_tripped = ctl_db::get_state(&state.db, ctl_schemas::state_keys::BREAKER_STATE)
        .await?
        .map(|v| v == ctl_schemas::BreakerState::Killswitch.as_str())
        .unwrap_or(false);

    if already_tripped {
        return Ok(());
    }

    ctl_db::set_state(&state.db, ctl_schemas::state_keys::STATE, RunState::Paused.as_str())
        .await?;
    ctl_db::set_state(
        &state.db,
        ctl_schemas::state_keys::BREAKER_STATE,
        ctl_schemas::BreakerState::Killswitch.as_str(),
    )
    .await?;

    let cancelled = {
        let mut orders = state.orders.lock().await;
        orders.cancel_all_non_terminal("killswitch")
    };

    ctl_db::emit(
        &state.db,
        Level::Warn,
        "stop.now",
        json!({ "cancelled_tokens": cancelled }),
    )
    .await?;

    Ok(())
}
