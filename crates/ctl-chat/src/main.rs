//! ctl-chatd entry point (C6): a long-poll loop against the chat API,
//! persisting its update offset in the bus store's `app_state` table so a
//! restart resumes rather than replays (spec §4.5).

use std::time::Duration;

use anyhow::Context;
use ctl_chat::{ingress, ingress::Outcome, state::ChatState};
use teloxide::prelude::*;
use teloxide::types::UpdateKind;
use tracing::{error, info, warn};

const STATE_KEY_CHAT_OFFSET: &str = "chat_update_offset";
const MAX_BACKOFF_SEC: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let config = ctl_config::Config::from_env().context("config.invalid")?;
    if !config.chat_enabled {
        info!("CHAT_ENABLED is not set; ctl-chatd has nothing to do, exiting");
        return Ok(());
    }

    let db = ctl_db::connect(&config.bus_db_path).await?;
    ctl_db::migrate(&db).await?;

    let token = config
        .chat_api_token
        .clone()
        .context("CHAT_ENABLED=1 but CHAT_API_TOKEN is unset")?;
    let long_poll_sec = config.chat_long_poll_sec.max(1) as u16;

    let bot = Bot::new(token);
    let mut state = ChatState::new(db, config);

    info!("ctl-chatd polling");
    run(bot, &mut state, long_poll_sec).await
}

async fn run(bot: Bot, state: &mut ChatState, long_poll_sec: u16) -> anyhow::Result<()> {
    let mut backoff_sec = 1u64;

    loop {
        let offset = ctl_db::get_state(&state.db, STATE_KEY_CHAT_OFFSET)
            .await?
            .and_then(|v| v.parse::<i32>().ok());

        let mut request = bot.get_updates().timeout(long_poll_sec);
        if let Some(offset) = offset {
            request = request.offset(offset);
        }

        let updates = match request.send().await {
            Ok(updates) => updates,
            Err(err) => {
                warn!(error = %err, backoff_sec, "long-poll request failed, backing off");
                tokio::time::sleep(Duration::from_secs(backoff_sec)).await;
                backoff_sec = (backoff_sec * 2).min(MAX_BACKOFF_SEC);
                continue;
            }
        };

        backoff_sec = 1;

        for update in updates {
            let next_offset = update.id.0 + 1;
            if let Err(err) = handle_update(&bot, state, update).await {
                error!(error = %err, "failed to handle chat update");
            }
            ctl_db::set_state(&state.db, STATE_KEY_CHAT_OFFSET, &next_offset.to_string()).await?;
        }
    }
}

async fn handle_update(bot: &Bot, state: &mut ChatState, update: Update) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp();

    match update.kind {
        UpdateKind::Message(message) => {
            let user_id = match message.from() {
                Some(user) => user.id.0.to_string(),
                None => return Ok(()),
            };
            let text = match message.text() {
                Some(text) => text,
                None => return Ok(()),
            };

            let outcome = ingress::handle_message(state, &user_id, text, now).await?;
            if let Some(reply) = outcome_text(&outcome) {
                bot.send_message(message.chat.id, reply).await?;
            }
        }
        UpdateKind::CallbackQuery(callback) => {
            let user_id = callback.from.id.0.to_string();
            let payload = callback.data.clone().unwrap_or_default();
            let outcome = ingress::handle_button(state, &user_id, &payload, now).await?;

            let mut answer = bot.answer_callback_query(callback.id.clone());
            if let Some(text) = outcome_text(&outcome) {
                answer = answer.text(text);
            }
            answer.await?;
        }
        _ => {}
    }

    Ok(())
}

/// `None` means the toast is silent (spec §4.5 point 2: rate-limited drops
/// are silent to avoid amplifying abuse).
fn outcome_text(outcome: &Outcome) -> Option<String> {
    Some(match outcome {
        Outcome::Enqueued { cmd_id } => format!("queued: {cmd_id}"),
        Outcome::PinAccepted => "pin accepted for 60s".to_string(),
        Outcome::AuthDenied => "denied".to_string(),
        Outcome::PinRequired => "send /pin <secret> first".to_string(),
        Outcome::RateLimited => return None,
        Outcome::Unrecognized => "unrecognized command".to_string(),
    })
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
