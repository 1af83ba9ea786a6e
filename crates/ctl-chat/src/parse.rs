//! Maps incoming chat text and inline-button payloads to bus commands
//! (spec §4.5 point 4, grammar in §6).

use serde_json::{json, Value};

/// A command ready to be offered to the approval/enqueue path.
pub struct ParsedCommand {
    pub cmd: String,
    pub args: Value,
    /// The `cmd_args_identity` used for approval/dedupe scoping — the order
    /// token for order commands, `None` for commands with no natural
    /// identity (state/mode/kill-switch).
    pub identity: Option<String>,
}

impl ParsedCommand {
    fn simple(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            args: json!({}),
            identity: None,
        }
    }

    fn with_token(cmd: &str, token: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            args: json!({ "token": token }),
            identity: Some(token.to_string()),
        }
    }
}

/// A successful `/pin <secret>` does not become a bus command; it only
/// authenticates the sender's session, so it is parsed separately.
pub enum ParsedMessage {
    Command(ParsedCommand),
    Pin(String),
    Unrecognized,
}

/// Parse a plain text command per the `/command [arg]` grammar.
pub fn parse_text(text: &str) -> ParsedMessage {
    let text = text.trim();
    let mut parts = text.splitn(2, char::is_whitespace);
    let head = match parts.next() {
        Some(h) => h,
        None => return ParsedMessage::Unrecognized,
    };
    let rest = parts.next().unwrap_or("").trim();

    match head {
        "/pause" => ParsedMessage::Command(ParsedCommand::simple("state.pause")),
        "/resume" => ParsedMessage::Command(ParsedCommand::simple("state.resume")),
        "/stop" => ParsedMessage::Command(ParsedCommand::simple("state.stop")),
        "/paper" => ParsedMessage::Command(ParsedCommand::simple_with_target("mode.switch", "paper")),
        "/live" => ParsedMessage::Command(ParsedCommand::simple_with_target("mode.switch", "live")),
        "/confirm" if !rest.is_empty() => {
            ParsedMessage::Command(ParsedCommand::with_token("orders.confirm", rest))
        }
        "/reject" if !rest.is_empty() => {
            ParsedMessage::Command(ParsedCommand::with_token("orders.reject", rest))
        }
        "/pin" if !rest.is_empty() => ParsedMessage::Pin(rest.to_string()),
        _ => ParsedMessage::Unrecognized,
    }
}

impl ParsedCommand {
    fn simple_with_target(cmd: &str, target: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            args: json!({ "target": target }),
            identity: None,
        }
    }
}

/// Parse an inline-button payload: `action:<cmd>|identity:<value>` (spec §6).
/// `identity` is optional for commands with no natural identity.
pub fn parse_button_payload(payload: &str) -> ParsedMessage {
    let mut cmd = None;
    let mut identity = None;

    for field in payload.split('|') {
        if let Some(value) = field.strip_prefix("action:") {
            cmd = Some(value.to_string());
        } else if let Some(value) = field.strip_prefix("identity:") {
            identity = Some(value.to_string());
        }
    }

    let cmd = match cmd {
        Some(c) => c,
        None => return ParsedMessage::Unrecognized,
    };

    let args = match &identity {
        Some(token) if cmd.starts_with("orders.") && cmd != "orders.confirm_all" => {
            json!({ "token": token })
        }
        _ => json!({}),
    };

    ParsedMessage::Command(ParsedCommand { cmd, args, identity })
}
