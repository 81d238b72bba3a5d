// Operator console: stdin commands in, status lines out.
//
// Lines starting with `/` are commands; anything else is a Steam Guard code
// and is handed to the authenticator, but only while it asks for one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use tradebot_app::auth::GuardCodeRequest;
use tradebot_app::dispatch::BotCommand;
use tradebot_app::status::UiUpdate;
use tradebot_core::protocol::{PersonaState, SteamId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(BotCommand),
    Text(String),
    Invalid(String),
}

pub fn parse_line(line: &str) -> ConsoleInput {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return ConsoleInput::Text(line.to_string());
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    let arg = parts.next();

    match (name.as_str(), arg) {
        ("quit" | "exit", _) => ConsoleInput::Command(BotCommand::Quit),
        ("close" | "cancel", _) => ConsoleInput::Command(BotCommand::CloseTrade),
        ("trade", Some(id)) => match id.parse::<u64>() {
            Ok(id) => ConsoleInput::Command(BotCommand::OpenTrade(SteamId(id))),
            Err(_) => ConsoleInput::Invalid(format!("not a Steam ID: {id}")),
        },
        ("trade", None) => ConsoleInput::Invalid("usage: /trade <steam id>".into()),
        ("persona", Some(state)) => match parse_persona_state(state) {
            Some(state) => ConsoleInput::Command(BotCommand::SetPersonaState(state)),
            None => ConsoleInput::Invalid(format!("unknown persona state: {state}")),
        },
        ("persona", None) => ConsoleInput::Invalid("usage: /persona <state>".into()),
        _ => ConsoleInput::Invalid(format!("unknown command: /{name}")),
    }
}

fn parse_persona_state(s: &str) -> Option<PersonaState> {
    match s.to_ascii_lowercase().as_str() {
        "offline" => Some(PersonaState::Offline),
        "online" => Some(PersonaState::Online),
        "busy" => Some(PersonaState::Busy),
        "away" => Some(PersonaState::Away),
        "snooze" => Some(PersonaState::Snooze),
        "trade" | "looking_to_trade" => Some(PersonaState::LookingToTrade),
        "play" | "looking_to_play" => Some(PersonaState::LookingToPlay),
        _ => None,
    }
}

/// Open while the authenticator waits for a Steam Guard code. Plain console
/// text is forwarded as operator input only then, one line per request.
#[derive(Clone, Default)]
pub struct GuardPrompt {
    open: Arc<AtomicBool>,
}

impl GuardPrompt {
    /// Guard-code callback: announce the request and accept the next line.
    /// The code itself arrives later through operator input.
    pub fn request(&self, request: &mut GuardCodeRequest) {
        self.open.store(true, Ordering::SeqCst);
        println!("{}", request.reason.prompt());
    }

    fn take(&self) -> bool {
        self.open.swap(false, Ordering::SeqCst)
    }
}

/// Read stdin until EOF, routing commands and operator text.
pub async fn run_input(
    commands: mpsc::Sender<BotCommand>,
    operator: mpsc::Sender<String>,
    prompt: GuardPrompt,
    shutdown: Arc<watch::Sender<bool>>,
) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    route_lines(stdin, &commands, &operator, &prompt, &shutdown).await
}

/// Route every line from `input`. Never waits on a busy dispatch loop, so
/// `/quit` always gets through.
pub async fn route_lines<R>(
    input: R,
    commands: &mpsc::Sender<BotCommand>,
    operator: &mpsc::Sender<String>,
    prompt: &GuardPrompt,
    shutdown: &watch::Sender<bool>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            ConsoleInput::Command(BotCommand::Quit) => {
                info!("Quit requested from console");
                shutdown.send_replace(true);
                break;
            }
            ConsoleInput::Command(command) => match commands.try_send(command) {
                Ok(()) => {}
                Err(TrySendError::Full(command)) => {
                    println!("Bot is busy, dropped {command:?}");
                }
                Err(TrySendError::Closed(_)) => break,
            },
            ConsoleInput::Text(text) if text.is_empty() => {}
            ConsoleInput::Text(text) => {
                if !prompt.take() {
                    println!("No Steam Guard code was requested; ignoring input");
                    continue;
                }
                if let Err(e) = operator.try_send(text) {
                    warn!("Could not hand over operator input: {}", e);
                }
            }
            ConsoleInput::Invalid(message) => println!("{message}"),
        }
    }
    info!("Console input closed");
    Ok(())
}

/// Render a status update for the terminal. `None` for updates that are only
/// useful to richer front ends.
pub fn render(update: &UiUpdate) -> Option<String> {
    match update {
        UiUpdate::Status { text, at } => Some(format!(
            "[{}] {}",
            at.with_timezone(&Local).format("%H:%M:%S"),
            text
        )),
        UiUpdate::Persona { name, state } => Some(format!("Persona: {name} ({state:?})")),
        UiUpdate::TradeOpened { peer } => Some(format!("Trading with {peer}")),
        UiUpdate::TradeClosed { peer } => Some(format!("Trade with {peer} closed")),
        UiUpdate::SessionState(_) => None,
    }
}

pub async fn print_updates(mut updates: mpsc::Receiver<UiUpdate>) {
    while let Some(update) = updates.recv().await {
        if let Some(line) = render(&update) {
            println!("{line}");
        }
    }
}
