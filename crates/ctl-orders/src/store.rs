//! In-process order ticket registry (C3): a `HashMap` keyed by token, backed
//! by an index file snapshot plus an append-only event log (spec §6, "Order
//! persistence").

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use ctl_audit::AuditWriter;
use ctl_schemas::{OrderState, OrderTicket, OrderType, Side};
use serde_json::json;
use uuid::Uuid;

use crate::state_machine::{TicketEvent, TicketMachine, TransitionError};

/// Read an existing `events.jsonl` tail so a reopened store continues the
/// same hash chain instead of starting a new one at `hash_prev=None`
/// (`AuditWriter::new` always starts fresh). Returns `(line_count, last_hash)`.
fn restore_audit_tail(path: &Path) -> Result<(u64, Option<String>), OrderStoreError> {
    if !path.exists() {
        return Ok((0, None));
    }
    let raw = fs::read_to_string(path)?;
    let mut seq = 0u64;
    let mut last_hash = None;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let ev: ctl_audit::AuditEvent = serde_json::from_str(line)?;
        seq += 1;
        last_hash = ev.hash_self;
    }
    Ok((seq, last_hash))
}

#[derive(Debug, thiserror::Error)]
pub enum OrderStoreError {
    #[error("unknown order token {0}")]
    UnknownToken(String),
    #[error("illegal transition: {0}")]
    Transition(#[from] TransitionError),
    #[error("index file I/O failed")]
    Io(#[from] std::io::Error),
    #[error("index file corrupt")]
    Corrupt(#[from] serde_json::Error),
    #[error(transparent)]
    Audit(#[from] anyhow::Error),
}

pub struct NewTicket {
    pub symbol: String,
    pub side: Side,
    pub qty: String,
    pub r#type: OrderType,
    pub limit_price: Option<String>,
    pub stop_price: Option<String>,
    pub expires_at: Option<i64>,
}

/// The order ticket registry. One process owns one `OrderStore`; the worker
/// is the only mutator, mirroring the bus store's single-writer rule.
pub struct OrderStore {
    tickets: BTreeMap<String, OrderTicket>,
    index_path: PathBuf,
    audit: AuditWriter,
}

impl OrderStore {
    /// Open (or create) the registry rooted at `dir`: `dir/index.json` for
    /// the token -> ticket snapshot, `dir/events.jsonl` for the audit trail.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, OrderStoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let index_path = dir.join("index.json");

        let tickets: BTreeMap<String, OrderTicket> = if index_path.exists() {
            let raw = fs::read_to_string(&index_path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            BTreeMap::new()
        };

        let audit_path = dir.join("events.jsonl");
        let (seq, last_hash) = restore_audit_tail(&audit_path)?;
        let mut audit = AuditWriter::new(&audit_path, true).map_err(OrderStoreError::Audit)?;
        audit.set_seq(seq);
        audit.set_last_hash(last_hash);

        Ok(Self {
            tickets,
            index_path,
            audit,
        })
    }

    fn persist_index(&self) -> Result<(), OrderStoreError> {
        let raw = serde_json::to_string_pretty(&self.tickets)?;
        fs::write(&self.index_path, raw)?;
        Ok(())
    }

    fn audit_event(&mut self, subject: Uuid, event_type: &str, payload: serde_json::Value) {
        if let Err(err) = self.audit.append(subject, "orders", event_type, payload) {
            tracing::warn!(error = %err, "order audit append failed");
        }
    }

    /// Generate a 8-character uppercase token unique among currently active
    /// (non-terminal) tickets.
    fn fresh_token(&self) -> String {
        loop {
            let candidate = Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase();
            let collides = self
                .tickets
                .get(&candidate)
                .map(|t| !t.state.is_terminal())
                .unwrap_or(false);
            if !collides {
                return candidate;
            }
        }
    }

    pub fn create(&mut self, new: NewTicket) -> OrderTicket {
        let token = self.fresh_token();
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp();

        let ticket = OrderTicket {
            id: id.clone(),
            token: token.clone(),
            symbol: new.symbol,
            side: new.side,
            qty: new.qty,
            r#type: new.r#type,
            limit_price: new.limit_price,
            stop_price: new.stop_price,
            state: OrderState::Pending,
            created_at,
            expires_at: new.expires_at,
            last_actor_by_source: BTreeMap::new(),
        };

        self.tickets.insert(token.clone(), ticket.clone());
        let _ = self.persist_index();
        let subject = Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::new_v4());
        self.audit_event(
            subject,
            "ticket.created",
            json!({ "token": token, "symbol": ticket.symbol, "side": format!("{:?}", ticket.side) }),
        );

        ticket
    }

    pub fn get(&self, token: &str) -> Option<&OrderTicket> {
        self.tickets.get(token)
    }

    pub fn list(&self) -> impl Iterator<Item = &OrderTicket> {
        self.tickets.values()
    }

    pub fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for t in self.tickets.values() {
            *counts.entry(t.state.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Apply a lifecycle event to a single ticket, recording the acting
    /// source/actor and appending an audit-log entry on success.
    pub fn apply(
        &mut self,
        token: &str,
        event: TicketEvent,
        source: &str,
        actor_id: &str,
        event_id: Option<&str>,
    ) -> Result<OrderTicket, OrderStoreError> {
        let ticket = self
            .tickets
            .get_mut(token)
            .ok_or_else(|| OrderStoreError::UnknownToken(token.to_string()))?;

        let mut machine = TicketMachine::new(ticket.state);
        machine.apply(&event, event_id)?;

        let prior_state = ticket.state;
        ticket.state = machine.state;
        ticket
            .last_actor_by_source
            .insert(source.to_string(), actor_id.to_string());

        let snapshot = ticket.clone();
        self.persist_index()?;

        let subject = Uuid::parse_str(&snapshot.id).unwrap_or_else(|_| Uuid::new_v4());
        self.audit_event(
            subject,
            "ticket.transitioned",
            json!({
                "token": token,
                "from": prior_state.as_str(),
                "to": snapshot.state.as_str(),
                "source": source,
                "actor_id": actor_id,
            }),
        );

        Ok(snapshot)
    }

    /// Bulk-cancel every `PENDING`/`CONFIRMED_CHAT` ticket (kill-switch,
    /// spec §4.4 `stop.now`). Terminal and `CONFIRMED` tickets are left
    /// untouched.
    pub fn cancel_all_non_terminal(&mut self, reason: &str) -> Vec<String> {
        let targets: Vec<String> = self
            .tickets
            .values()
            .filter(|t| matches!(t.state, OrderState::Pending | OrderState::ConfirmedChat))
            .map(|t| t.token.clone())
            .collect();

        let mut cancelled = Vec::new();
        for token in targets {
            let result = self.apply(
                &token,
                TicketEvent::Cancel {
                    reason: reason.to_string(),
                },
                "supervisor",
                "supervisor:killswitch",
                None,
            );
            if result.is_ok() {
                cancelled.push(token);
            }
        }
        cancelled
    }

    /// All tickets still `PENDING` or `CONFIRMED_CHAT` (targets of
    /// `orders.confirm_all`).
    pub fn pending_tokens(&self) -> Vec<String> {
        self.tickets
            .values()
            .filter(|t| matches!(t.state, OrderState::Pending | OrderState::ConfirmedChat))
            .map(|t| t.token.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(store: &mut OrderStore) -> OrderTicket {
        store.create(NewTicket {
            symbol: "SPY".into(),
            side: Side::Buy,
            qty: "10".into(),
            r#type: OrderType::Market,
            limit_price: None,
            stop_price: None,
            expires_at: None,
        })
    }

    #[test]
    fn create_then_lookup_by_token_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OrderStore::open(dir.path()).unwrap();
        let ticket = sample(&mut store);
        let found = store.get(&ticket.token).unwrap();
        assert_eq!(found.token, ticket.token);
        assert_eq!(found.state, OrderState::Pending);
    }

    #[test]
    fn unknown_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OrderStore::open(dir.path()).unwrap();
        let err = store.apply(
            "NOSUCH01",
            TicketEvent::ConfirmDual,
            "cli",
            "cli:1",
            None,
        );
        assert!(matches!(err, Err(OrderStoreError::UnknownToken(_))));
    }

    #[test]
    fn kill_switch_cancels_pending_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OrderStore::open(dir.path()).unwrap();
        let a = sample(&mut store);
        let b = sample(&mut store);
        store
            .apply(&b.token, TicketEvent::ConfirmDual, "cli", "cli:1", None)
            .unwrap();

        let cancelled = store.cancel_all_non_terminal("killswitch");
        assert_eq!(cancelled, vec![a.token.clone()]);
        assert_eq!(store.get(&a.token).unwrap().state, OrderState::Canceled);
        assert_eq!(store.get(&b.token).unwrap().state, OrderState::Confirmed);
    }

    #[test]
    fn index_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let mut store = OrderStore::open(dir.path()).unwrap();
            sample(&mut store).token
        };

        let store = OrderStore::open(dir.path()).unwrap();
        assert!(store.get(&token).is_some());
    }
}
