//! `ctl` — the CLI facade (C8): enqueues commands with `source="cli"` and
//! can drain the queue in-process. Thin by design; all behavior lives in
//! `ctl-db`/`ctl-worker`.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctl_schemas::{state_keys, Source};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_OR_HEALTH: u8 = 2;
const EXIT_STORAGE: u8 = 4;

#[derive(Parser)]
#[command(name = "ctl", about = "Control-plane CLI facade", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a command onto the bus.
    Enqueue {
        /// Dotted command name, e.g. `state.pause`.
        #[arg(long)]
        cmd: String,
        /// JSON-encoded argument map. Defaults to `{}`.
        #[arg(long)]
        args: Option<String>,
        /// Optional dedupe key; repeated enqueues with the same key while
        /// the first is non-terminal resolve to the same `cmd_id`.
        #[arg(long = "dedupe-key")]
        dedupe_key: Option<String>,
        /// Optional TTL in seconds after which an undequeued command expires.
        #[arg(long = "ttl-sec")]
        ttl_sec: Option<i64>,
    },
    /// List (or, with --apply, execute) pending NEW commands.
    Drain {
        /// Execute the drained commands via an in-process worker instead of
        /// just listing them.
        #[arg(long)]
        apply: bool,
    },
    /// Enqueue the `stop.now` kill-switch.
    #[command(name = "stop-now")]
    StopNow,
    /// Exit 0 if storage is reachable and the worker heartbeat is fresh.
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_STORAGE)
        }
    }
}

async fn run() -> Result<u8> {
    let cli = Cli::parse();

    let config = ctl_config::Config::from_env().context("config.invalid")?;
    let db = ctl_db::connect(&config.bus_db_path)
        .await
        .context("storage.unavailable")?;
    ctl_db::migrate(&db).await.context("storage.unavailable")?;

    let actor_id = format!("cli:{}", std::process::id());

    match cli.cmd {
        Commands::Enqueue { cmd, args, dedupe_key, ttl_sec } => {
            let args = match args {
                Some(raw) => serde_json::from_str(&raw).context("--args must be valid JSON")?,
                None => serde_json::json!({}),
            };
            let cmd_id = ctl_db::enqueue(
                &db,
                &cmd,
                args,
                Source::Cli,
                ttl_sec,
                dedupe_key.as_deref(),
                Some(&actor_id),
            )
            .await?;
            println!("{cmd_id}");
            Ok(EXIT_OK)
        }

        Commands::StopNow => {
            let cmd_id = ctl_db::enqueue(
                &db,
                "stop.now",
                serde_json::json!({}),
                Source::Cli,
                None,
                None,
                Some(&actor_id),
            )
            .await?;
            println!("{cmd_id}");
            Ok(EXIT_OK)
        }

        Commands::Drain { apply } => {
            if !apply {
                let pending = ctl_db::list_new(&db).await?;
                for cmd in &pending {
                    println!("{} {} source={}", cmd.cmd_id, cmd.cmd, cmd.source);
                }
                println!("{} command(s) pending", pending.len());
                return Ok(EXIT_OK);
            }

            let orders = ctl_orders::OrderStore::open("runtime/orders")
                .map_err(|e| anyhow::anyhow!(e.to_string()))
                .context("opening order store")?;
            let state = ctl_worker::state::AppState::new(db.clone(), orders, config);

            let mut processed = 0u64;
            while ctl_worker::worker::step(&state).await? {
                processed += 1;
            }
            println!("{processed} command(s) processed");
            Ok(EXIT_OK)
        }

        Commands::Health => {
            let storage_reachable = ctl_db::get_state(&db, state_keys::STATE).await.is_ok();
            let heartbeat_age = ctl_db::get_state(&db, state_keys::WORKER_HEARTBEAT_TS)
                .await
                .ok()
                .flatten()
                .and_then(|v| v.parse::<i64>().ok())
                .map(|ts| chrono::Utc::now().timestamp() - ts);

            let heartbeat_ok = heartbeat_age.map(|age| age <= 10).unwrap_or(false);
            let ok = storage_reachable && heartbeat_ok;

            println!(
                "storage_reachable={storage_reachable} worker_heartbeat_age_sec={}",
                heartbeat_age.map(|a| a.to_string()).unwrap_or_else(|| "n/a".to_string())
            );

            if ok {
                Ok(EXIT_OK)
            } else {
                Ok(EXIT_CONFIG_OR_HEALTH)
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}
