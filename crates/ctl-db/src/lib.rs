//! The bus store (C1) and the approval ledger (C2).
//!
//! Single-writer SQLite with WAL enabled — the control plane has exactly one
//! writer (the worker); ingress components and the CLI only ever call
//! [`enqueue`], and the projection surface only ever reads.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use ctl_schemas::{
    Approval, ApprovalDecision, Command, CommandStatus, Event, Level, Source,
};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteJournalMode};
use sqlx::{Row, SqlitePool};

pub const ENV_DB_PATH: &str = "BUS_DB_PATH";
pub const DEFAULT_DB_PATH: &str = "runtime/ctl.db";

/// Connect using `BUS_DB_PATH`, falling back to [`DEFAULT_DB_PATH`] if unset.
/// `ctl-config` is responsible for treating a genuinely missing value as
/// `config.invalid` at startup; this function just resolves the path.
pub async fn connect_from_env() -> Result<SqlitePool> {
    let path = std::env::var(ENV_DB_PATH).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    connect(&path).await
}

/// Open (creating if absent) a WAL-mode SQLite pool at `path`.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory for {path}"))?;
        }
    }

    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
        .with_context(|| format!("invalid sqlite path {path}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await
        .context("failed to open bus store")?;

    Ok(pool)
}

/// Run embedded migrations. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("bus store migrate failed")?;
    Ok(())
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn row_to_command(row: &sqlx::sqlite::SqliteRow) -> Result<Command> {
    let source_str: String = row.try_get("source")?;
    let status_str: String = row.try_get("status")?;
    let args_str: String = row.try_get("args")?;
    Ok(Command {
        id: row.try_get("id")?,
        cmd_id: row.try_get("cmd_id")?,
        cmd: row.try_get("cmd")?,
        args: serde_json::from_str(&args_str).unwrap_or(Value::Null),
        source: Source::parse(&source_str).unwrap_or(Source::Test),
        status: CommandStatus::parse(&status_str).unwrap_or(CommandStatus::Error),
        dedupe_key: row.try_get("dedupe_key")?,
        retry_count: row.try_get("retry_count")?,
        available_at: row.try_get("available_at")?,
        ttl_sec: row.try_get("ttl_sec")?,
        created_at: row.try_get("created_at")?,
        actor_id: row.try_get("actor_id")?,
    })
}

/// Enqueue a command. If `dedupe_key` is set and an active (non-terminal)
/// command with the same key exists, its `cmd_id` is returned without
/// inserting a new row.
pub async fn enqueue(
    pool: &SqlitePool,
    cmd: &str,
    args: Value,
    source: Source,
    ttl_sec: Option<i64>,
    dedupe_key: Option<&str>,
    actor_id: Option<&str>,
) -> Result<String> {
    if let Some(key) = dedupe_key {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT cmd_id FROM commands WHERE dedupe_key = ? AND status = 'NEW' \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("enqueue dedupe lookup failed")?;

        if let Some((existing_id,)) = existing {
            return Ok(existing_id);
        }
    }

    let cmd_id = uuid::Uuid::new_v4().to_string();
    let now = now_unix();
    let args_str = serde_json::to_string(&args).context("serializing command args")?;

    sqlx::query(
        "INSERT INTO commands \
         (cmd_id, cmd, args, source, status, dedupe_key, retry_count, available_at, ttl_sec, created_at, actor_id) \
         VALUES (?, ?, ?, ?, 'NEW', ?, 0, ?, ?, ?, ?)",
    )
    .bind(&cmd_id)
    .bind(cmd)
    .bind(&args_str)
    .bind(source.as_str())
    .bind(dedupe_key)
    .bind(now)
    .bind(ttl_sec)
    .bind(now)
    .bind(actor_id)
    .execute(pool)
    .await
    .context("enqueue insert failed")?;

    Ok(cmd_id)
}

/// Select the oldest eligible `NEW` command, expiring any TTL-aged rows it
/// scans past along the way (testable property 2: TTL correctness).
pub async fn next_new(pool: &SqlitePool) -> Result<Option<Command>> {
    let now = now_unix();

    loop {
        let row = sqlx::query(
            "SELECT * FROM commands WHERE status = 'NEW' AND available_at <= ? \
             ORDER BY available_at ASC, id ASC LIMIT 1",
        )
        .bind(now)
        .fetch_optional(pool)
        .await
        .context("next_new select failed")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let command = row_to_command(&row)?;

        if let Some(ttl) = command.ttl_sec {
            if command.created_at + ttl < now {
                mark_error(pool, &command.cmd_id, "ttl.expired").await?;
                emit(
                    pool,
                    Level::Warn,
                    "command.ttl.expired",
                    json!({ "cmd_id": command.cmd_id, "cmd": command.cmd }),
                )
                .await?;
                continue;
            }
        }

        return Ok(Some(command));
    }
}

/// Select the oldest eligible NEW command matching `cmd_name` specifically,
/// skipping FIFO order. Used by the worker to find a queued `state.resume`
/// while the breaker is tripped and every other command is held (spec §4.4).
pub async fn next_new_matching(pool: &SqlitePool, cmd_name: &str) -> Result<Option<Command>> {
    let now = now_unix();
    let row = sqlx::query(
        "SELECT * FROM commands WHERE status = 'NEW' AND cmd = ? AND available_at <= ? \
         ORDER BY available_at ASC, id ASC LIMIT 1",
    )
    .bind(cmd_name)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("next_new_matching select failed")?;

    row.as_ref().map(row_to_command).transpose()
}

/// List every eligible `NEW` row in dequeue order, without side effects —
/// used by `ctl drain` to preview the queue (spec §4.7).
pub async fn list_new(pool: &SqlitePool) -> Result<Vec<Command>> {
    let now = now_unix();
    let rows = sqlx::query(
        "SELECT * FROM commands WHERE status = 'NEW' AND available_at <= ? \
         ORDER BY available_at ASC, id ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("list_new select failed")?;

    rows.iter().map(row_to_command).collect()
}

pub async fn mark_done(pool: &SqlitePool, cmd_id: &str) -> Result<()> {
    sqlx::query("UPDATE commands SET status = 'DONE' WHERE cmd_id = ?")
        .bind(cmd_id)
        .execute(pool)
        .await
        .context("mark_done failed")?;
    Ok(())
}

/// Mark a command ERROR and emit `command.error`. The store never
/// self-retries (spec §9): `backoff_sec` is recorded on the emitted event
/// only, for an out-of-scope re-enqueue policy to consume.
pub async fn mark_error(pool: &SqlitePool, cmd_id: &str, reason: &str) -> Result<()> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT retry_count FROM commands WHERE cmd_id = ?")
        .bind(cmd_id)
        .fetch_optional(pool)
        .await
        .context("mark_error lookup failed")?;

    let retry_count = row.map(|(n,)| n + 1).unwrap_or(1);

    sqlx::query("UPDATE commands SET status = 'ERROR', retry_count = ? WHERE cmd_id = ?")
        .bind(retry_count)
        .bind(cmd_id)
        .execute(pool)
        .await
        .context("mark_error update failed")?;

    emit(
        pool,
        Level::Error,
        "command.error",
        json!({ "cmd_id": cmd_id, "reason": reason, "retry_count": retry_count }),
    )
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub async fn emit(pool: &SqlitePool, level: Level, message: &str, fields: Value) -> Result<Event> {
    let ts = now_unix();
    let fields_str = serde_json::to_string(&fields).context("serializing event fields")?;

    let id = sqlx::query("INSERT INTO events (ts, level, message, fields) VALUES (?, ?, ?, ?)")
        .bind(ts)
        .bind(level.as_str())
        .bind(message)
        .bind(&fields_str)
        .execute(pool)
        .await
        .context("emit insert failed")?
        .last_insert_rowid();

    tracing::debug!(event_id = id, message, "event emitted");

    Ok(Event {
        id,
        ts,
        level,
        message: message.to_string(),
        fields,
    })
}

/// Return up to `limit` events, newest first, optionally only those strictly
/// after `since_id` (returned oldest-first in that case for incremental
/// consumption).
pub async fn tail_events(
    pool: &SqlitePool,
    limit: i64,
    since_id: Option<i64>,
) -> Result<Vec<Event>> {
    let rows = if let Some(since_id) = since_id {
        sqlx::query("SELECT * FROM events WHERE id > ? ORDER BY id ASC LIMIT ?")
            .bind(since_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    } else {
        sqlx::query("SELECT * FROM events ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await
    }
    .context("tail_events query failed")?;

    rows.into_iter()
        .map(|row| {
            let level_str: String = row.try_get("level")?;
            let fields_str: String = row.try_get("fields")?;
            Ok(Event {
                id: row.try_get("id")?,
                ts: row.try_get("ts")?,
                level: Level::parse(&level_str).unwrap_or(Level::Info),
                message: row.try_get("message")?,
                fields: serde_json::from_str(&fields_str).unwrap_or(Value::Null),
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .context("decoding event rows")
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub async fn set_state(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO app_state (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(now_iso())
    .execute(pool)
    .await
    .context("set_state failed")?;
    Ok(())
}

pub async fn get_state(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_state WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("get_state failed")?;
    Ok(row.map(|(v,)| v))
}

/// Snapshot of every recognized `app_state` key, for the projection API.
pub async fn all_state(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM app_state")
        .fetch_all(pool)
        .await
        .context("all_state failed")?;
    Ok(rows)
}

/// Rolling KPI: `(done_count, error_count)` across all commands, for the
/// projection API's command success/error counters.
pub async fn command_outcome_counts(pool: &SqlitePool) -> Result<(i64, i64)> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT \
           (SELECT COUNT(*) FROM commands WHERE status = 'DONE'), \
           (SELECT COUNT(*) FROM commands WHERE status = 'ERROR')",
    )
    .fetch_one(pool)
    .await
    .context("command_outcome_counts failed")?;
    Ok(row)
}

/// Rolling KPI: events emitted in the trailing 60 seconds.
pub async fn events_per_minute(pool: &SqlitePool) -> Result<i64> {
    let now = now_unix();
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE ts >= ?")
        .bind(now - 60)
        .fetch_one(pool)
        .await
        .context("events_per_minute failed")?;
    Ok(row.0)
}

// ---------------------------------------------------------------------------
// Approval ledger (C2)
// ---------------------------------------------------------------------------

fn row_to_approval(row: &sqlx::sqlite::SqliteRow) -> Result<Approval> {
    let sources_str: String = row.try_get("sources_seen")?;
    let actors_str: String = row.try_get("actors_seen")?;
    Ok(Approval {
        cmd_name: row.try_get("cmd_name")?,
        identity: row.try_get("identity")?,
        required: row.try_get("required")?,
        window_sec: row.try_get("window_sec")?,
        sources_seen: serde_json::from_str(&sources_str).unwrap_or_default(),
        actors_seen: serde_json::from_str(&actors_str).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        fulfilled_at: row.try_get("fulfilled_at")?,
        expired_at: row.try_get("expired_at")?,
    })
}

async fn fetch_approval(
    pool: &SqlitePool,
    cmd_name: &str,
    identity: &str,
) -> Result<Option<Approval>> {
    let row = sqlx::query("SELECT * FROM approvals WHERE cmd_name = ? AND identity = ?")
        .bind(cmd_name)
        .bind(identity)
        .fetch_optional(pool)
        .await
        .context("fetch_approval failed")?;

    row.as_ref().map(row_to_approval).transpose()
}

/// Sweep every non-terminal approval whose window has lapsed to `expired`,
/// emitting one `approval.expired` event per row (spec §4.3 rule 3). Called
/// by [`offer_approval`] before it applies a new offer, and once per worker
/// iteration (`ctl_worker::worker::step`) so a lone approval that never
/// receives a second offer still expires passively, per spec §8 S4 ("at
/// t=91s the next worker iteration emits `approval.expired`").
pub async fn sweep_expired_approvals(pool: &SqlitePool) -> Result<()> {
    let now = now_unix();
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT cmd_name, identity FROM approvals \
         WHERE fulfilled_at IS NULL AND expired_at IS NULL \
           AND ? - created_at > window_sec",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("sweep_expired_approvals query failed")?;

    for (cmd_name, identity) in rows {
        sqlx::query("UPDATE approvals SET expired_at = ? WHERE cmd_name = ? AND identity = ?")
            .bind(now)
            .bind(&cmd_name)
            .bind(&identity)
            .execute(pool)
            .await
            .context("approval expiry update failed")?;

        emit(
            pool,
            Level::Warn,
            "approval.expired",
            json!({ "cmd_name": cmd_name, "identity": identity }),
        )
        .await?;
    }

    Ok(())
}

/// Offer an approval toward a HIGH/CRITICAL-risk command (§4.3). Sweeps
/// expiry on every access before applying the new offer.
#[allow(clippy::too_many_arguments)]
pub async fn offer_approval(
    pool: &SqlitePool,
    cmd_name: &str,
    identity: &str,
    source: Source,
    actor_id: &str,
    required: i64,
    window_sec: i64,
    dual_control_strict: bool,
) -> Result<(ApprovalDecision, Approval)> {
    sweep_expired_approvals(pool).await?;

    let existing = fetch_approval(pool, cmd_name, identity).await?;
    let now = now_unix();

    let Some(mut approval) = existing else {
        let sources = vec![source.as_str().to_string()];
        let actors = vec![actor_id.to_string()];

        sqlx::query(
            "INSERT INTO approvals \
             (cmd_name, identity, required, window_sec, sources_seen, actors_seen, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cmd_name)
        .bind(identity)
        .bind(required)
        .bind(window_sec)
        .bind(serde_json::to_string(&sources)?)
        .bind(serde_json::to_string(&actors)?)
        .bind(now)
        .execute(pool)
        .await
        .context("approval insert failed")?;

        emit(
            pool,
            Level::Info,
            "approval.pending",
            json!({ "cmd_name": cmd_name, "identity": identity, "sources": sources }),
        )
        .await?;

        let created = fetch_approval(pool, cmd_name, identity)
            .await?
            .expect("row just inserted");

        if fulfillment_met(&created, dual_control_strict) {
            return Ok(fulfill(pool, cmd_name, identity, created).await?);
        }

        return Ok((ApprovalDecision::Pending, created));
    };

    if approval.is_terminal() {
        return Ok((ApprovalDecision::Expired, approval));
    }

    if approval.sources_seen.contains(&source.as_str().to_string()) {
        emit(
            pool,
            Level::Warn,
            "approval.duplicate_source",
            json!({ "cmd_name": cmd_name, "identity": identity, "source": source.as_str() }),
        )
        .await?;
        return Ok((ApprovalDecision::RejectedDuplicateSource, approval));
    }

    approval.sources_seen.push(source.as_str().to_string());
    approval.actors_seen.push(actor_id.to_string());

    sqlx::query(
        "UPDATE approvals SET sources_seen = ?, actors_seen = ? \
         WHERE cmd_name = ? AND identity = ?",
    )
    .bind(serde_json::to_string(&approval.sources_seen)?)
    .bind(serde_json::to_string(&approval.actors_seen)?)
    .bind(cmd_name)
    .bind(identity)
    .execute(pool)
    .await
    .context("approval update failed")?;

    if fulfillment_met(&approval, dual_control_strict) {
        return Ok(fulfill(pool, cmd_name, identity, approval).await?);
    }

    Ok((ApprovalDecision::Pending, approval))
}

fn fulfillment_met(approval: &Approval, dual_control_strict: bool) -> bool {
    let distinct_sources: std::collections::HashSet<_> = approval.sources_seen.iter().collect();
    if (distinct_sources.len() as i64) < approval.required {
        return false;
    }
    if dual_control_strict {
        let distinct_actors: std::collections::HashSet<_> = approval.actors_seen.iter().collect();
        if (distinct_actors.len() as i64) < approval.required {
            return false;
        }
    }
    true
}

async fn fulfill(
    pool: &SqlitePool,
    cmd_name: &str,
    identity: &str,
    mut approval: Approval,
) -> Result<(ApprovalDecision, Approval)> {
    let now = now_unix();
    sqlx::query("UPDATE approvals SET fulfilled_at = ? WHERE cmd_name = ? AND identity = ?")
        .bind(now)
        .bind(cmd_name)
        .bind(identity)
        .execute(pool)
        .await
        .context("approval fulfillment update failed")?;

    approval.fulfilled_at = Some(now);

    emit(
        pool,
        Level::Ok,
        "approval.fulfilled",
        json!({ "cmd_name": cmd_name, "identity": identity, "sources": approval.sources_seen }),
    )
    .await?;

    Ok((ApprovalDecision::Fulfilled, approval))
}

/// Aggregate for the projection API: count and max age of pending approvals.
pub async fn pending_approvals_summary(pool: &SqlitePool) -> Result<(i64, i64)> {
    let now = now_unix();
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT created_at FROM approvals WHERE fulfilled_at IS NULL AND expired_at IS NULL",
    )
    .fetch_all(pool)
    .await
    .context("pending_approvals_summary failed")?;

    let count = rows.len() as i64;
    let max_age = rows.iter().map(|(c,)| now - c).max().unwrap_or(0);
    Ok((count, max_age))
}
