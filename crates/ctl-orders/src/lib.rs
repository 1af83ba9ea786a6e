//! Order ticket registry (C3): lifecycle state machine plus an in-process,
//! file-backed store keyed by short token.

pub mod state_machine;
pub mod store;

pub use state_machine::{TicketEvent, TicketMachine, TransitionError};
pub use store::{NewTicket, OrderStore, OrderStoreError};
