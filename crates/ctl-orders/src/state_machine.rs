//! Explicit state machine for a single order ticket.
//!
//! Every lifecycle change is applied via [`TicketMachine::apply`], which
//! enforces two invariants:
//!
//! 1. **Legal transitions only.** An illegal event returns
//!    [`TransitionError`]; callers mark the command ERROR and emit
//!    `command.rejected` rather than mutating the ticket.
//! 2. **Idempotent replay.** If an `event_id` is supplied and has already
//!    been applied, the call is a silent no-op.
//!
//! ```text
//! PENDING        -> CONFIRMED_CHAT (single relaxed-rule approval)
//! PENDING        -> CONFIRMED (dual approval) | REJECTED | CANCELED | EXPIRED
//! CONFIRMED_CHAT -> CONFIRMED (second distinct-source approval) | CANCELED | EXPIRED
//! CONFIRMED      -> FILLED (external) | CANCELED
//! REJECTED/CANCELED/EXPIRED/FILLED -> terminal
//! ```

use std::collections::HashSet;

use ctl_schemas::OrderState;

/// Events that drive an [`OrderTicket`](ctl_schemas::OrderTicket) transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketEvent {
    /// First approval under the chat single-channel relaxed rule.
    ConfirmChat,
    /// Second (or, from `PENDING`, a simultaneous dual) distinct-source approval.
    ConfirmDual,
    Reject,
    Cancel { reason: String },
    Expire,
    /// External fill notification; never originates from a handler.
    Fill,
}

impl std::fmt::Display for TicketEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Returned when an event cannot legally be applied in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: OrderState,
    pub event: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal order ticket transition: {:?} + {}",
            self.from, self.event
        )
    }
}

impl std::error::Error for TransitionError {}

/// Drives an order ticket's lifecycle in isolation from its other fields.
#[derive(Debug, Clone)]
pub struct TicketMachine {
    pub state: OrderState,
    applied: HashSet<String>,
}

impl TicketMachine {
    pub fn new(state: OrderState) -> Self {
        Self {
            state,
            applied: HashSet::new(),
        }
    }

    pub fn apply(
        &mut self,
        event: &TicketEvent,
        event_id: Option<&str>,
    ) -> Result<(), TransitionError> {
        if let Some(id) = event_id {
            if self.applied.contains(id) {
                return Ok(());
            }
        }

        self.do_transition(event)?;

        if let Some(id) = event_id {
            self.applied.insert(id.to_string());
        }

        Ok(())
    }

    fn do_transition(&mut self, event: &TicketEvent) -> Result<(), TransitionError> {
        use OrderState::*;
        use TicketEvent::*;

        match (&self.state, event) {
            (Pending, ConfirmChat) => {
                self.state = ConfirmedChat;
            }
            (Pending, ConfirmDual) => {
                self.state = Confirmed;
            }
            (Pending, Reject) => {
                self.state = Rejected;
            }
            (Pending | ConfirmedChat, Cancel { .. }) => {
                self.state = Canceled;
            }
            (Pending | ConfirmedChat, Expire) => {
                self.state = Expired;
            }
            (ConfirmedChat, ConfirmDual) => {
                self.state = Confirmed;
            }
            (Confirmed, Fill) => {
                self.state = Filled;
            }
            (Confirmed, Cancel { .. }) => {
                self.state = Canceled;
            }
            (from, ev) => {
                return Err(TransitionError {
                    from: *from,
                    event: ev.to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_approval_confirms_directly_from_pending() {
        let mut m = TicketMachine::new(OrderState::Pending);
        m.apply(&TicketEvent::ConfirmDual, None).unwrap();
        assert_eq!(m.state, OrderState::Confirmed);
    }

    #[test]
    fn chat_then_dual_confirms_via_confirmed_chat() {
        let mut m = TicketMachine::new(OrderState::Pending);
        m.apply(&TicketEvent::ConfirmChat, None).unwrap();
        assert_eq!(m.state, OrderState::ConfirmedChat);
        m.apply(&TicketEvent::ConfirmDual, None).unwrap();
        assert_eq!(m.state, OrderState::Confirmed);
    }

    #[test]
    fn terminal_states_reject_further_events() {
        let mut m = TicketMachine::new(OrderState::Filled);
        let err = m.apply(&TicketEvent::Cancel { reason: "late".into() }, None);
        assert!(err.is_err());
    }

    #[test]
    fn replay_with_same_event_id_is_a_no_op() {
        let mut m = TicketMachine::new(OrderState::Pending);
        m.apply(&TicketEvent::ConfirmDual, Some("evt-1")).unwrap();
        assert_eq!(m.state, OrderState::Confirmed);

        // Replaying the same event_id must not error even though Confirmed
        // no longer accepts ConfirmDual.
        m.apply(&TicketEvent::ConfirmDual, Some("evt-1")).unwrap();
        assert_eq!(m.state, OrderState::Confirmed);
    }

    #[test]
    fn kill_switch_cancels_pending_and_confirmed_chat_but_not_confirmed() {
        let mut pending = TicketMachine::new(OrderState::Pending);
        pending
            .apply(&TicketEvent::Cancel { reason: "killswitch".into() }, None)
            .unwrap();
        assert_eq!(pending.state, OrderState::Canceled);

        let mut confirmed = TicketMachine::new(OrderState::Confirmed);
        // Confirmed tickets are not part of the kill-switch bulk-cancel set
        // (spec: only PENDING and CONFIRMED_CHAT are cancelled), but cancel
        // remains a legal manual transition from CONFIRMED.
        confirmed
            .apply(&TicketEvent::Cancel { reason: "manual".into() }, None)
            .unwrap();
        assert_eq!(confirmed.state, OrderState::Canceled);
    }
}
