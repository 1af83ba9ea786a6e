//! ctl-workerd library target.
//!
//! Exposes the worker loop, handler contracts, router, and shared state for
//! the binary in `main.rs` and for integration tests.

pub mod api_types;
pub mod breaker;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod worker;
