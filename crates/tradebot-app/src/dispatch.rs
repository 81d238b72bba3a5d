// Single-task dispatch loop. Every inbound event, operator command and
// watchdog tick is handled here, in arrival order, against one `BotState`.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tradebot_core::config::{Config, TradeConfig};
use tradebot_core::protocol::{
    ChatEntryType, FriendEntry, InboundEvent, PersonaState, SteamId, TradeEvent,
};

use crate::auth::Authenticator;
use crate::client::Services;
use crate::friends::{FriendChange, FriendSet};
use crate::handler::HandlerRegistry;
use crate::session::SessionManager;
use crate::status::UiUpdate;
use crate::trade::{TradeEventKind, TradeOrchestrator};
use crate::watchdog::TradeWatchdog;

/// Commands from the operator console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Quit,
    OpenTrade(SteamId),
    CloseTrade,
    SetPersonaState(PersonaState),
}

/// Runtime settings derived from the loaded config.
#[derive(Debug, Clone)]
pub struct BotSettings {
    pub persona_name: String,
    /// Canned reply to every chat message, if any.
    pub chat_response: Option<String>,
    pub admins: Vec<SteamId>,
    pub trade: TradeConfig,
}

impl BotSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            persona_name: config.persona_name(),
            chat_response: config.bot.chat_response.clone(),
            admins: config.bot.admins.iter().copied().map(SteamId).collect(),
            trade: config.trade.clone(),
        }
    }
}

/// Everything the dispatch loop owns.
pub struct BotState {
    pub settings: BotSettings,
    pub services: Services,
    pub session: SessionManager,
    pub trades: TradeOrchestrator,
    pub friends: FriendSet,
    pub watchdog: TradeWatchdog,
}

impl BotState {
    pub fn new(
        settings: BotSettings,
        services: Services,
        auth: Authenticator,
        handlers: HandlerRegistry,
    ) -> Self {
        let session = SessionManager::new(auth, settings.persona_name.clone());
        let watchdog = TradeWatchdog::from_config(&settings.trade);
        Self {
            settings,
            services,
            session,
            trades: TradeOrchestrator::new(handlers),
            friends: FriendSet::new(),
            watchdog,
        }
    }

    pub fn is_admin(&self, id: SteamId) -> bool {
        self.settings.admins.contains(&id)
    }

    /// Our id, but only once fully logged on.
    fn logged_on_id(&self) -> Option<SteamId> {
        if self.session.is_logged_on() {
            self.session.own_id()
        } else {
            None
        }
    }
}

/// Run the dispatch loop until `Quit`, a closed command channel or a closed
/// event stream. Returns the final state after shutting the session down.
pub async fn run(
    mut events: mpsc::Receiver<InboundEvent>,
    mut commands: mpsc::Receiver<BotCommand>,
    mut state: BotState,
) -> anyhow::Result<BotState> {
    info!("Dispatch loop started");
    state.session.connect(&state.services);

    let mut tick = tokio::time::interval(state.settings.trade.polling_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    tick.tick().await;

    loop {
        tokio::select! {
            biased;

            event = events.recv() => {
                match event {
                    Some(event) => dispatch_event(&mut state, event).await,
                    None => {
                        info!("Event stream closed, shutting down");
                        break;
                    }
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    Some(BotCommand::Quit) | None => {
                        info!("Quit requested");
                        break;
                    }
                    Some(cmd) => handle_command(&mut state, cmd),
                }
            }

            _ = tick.tick() => check_watchdog(&mut state),
        }
    }

    state.trades.close(&state.services);
    state.watchdog.disarm();
    state.session.shutdown(&state.services);
    info!("Dispatch loop stopped");
    Ok(state)
}

/// Handle one event, containing any panic so the loop keeps going.
pub async fn dispatch_event(state: &mut BotState, event: InboundEvent) {
    let name = event.name();
    let outcome = AssertUnwindSafe(handle_event(state, event))
        .catch_unwind()
        .await;
    if let Err(panic) = outcome {
        error!("Handler for {} event panicked: {}", name, panic_message(&*panic));
    }
    if !state.trades.is_active() {
        state.watchdog.disarm();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

async fn handle_event(state: &mut BotState, event: InboundEvent) {
    debug!("Inbound event: {}", event.name());
    match event {
        InboundEvent::Connected { result } => {
            state.session.on_connected(result, &state.services).await;
        }
        InboundEvent::Disconnected => {
            state.session.on_disconnected(&state.services);
            state.trades.close(&state.services);
            state.session.connect(&state.services);
        }
        InboundEvent::LoggedOn { result, steam_id } => {
            state
                .session
                .on_logged_on(result, steam_id, &state.services)
                .await;
        }
        InboundEvent::LoginKey {
            login_key,
            unique_id,
        } => {
            state
                .session
                .on_login_key(&login_key, unique_id, &state.services)
                .await;
            if let Some(schema) = state.session.schema() {
                state.trades.set_schema(schema);
            }
        }
        InboundEvent::MachineAuth { job_id, payload } => {
            state
                .session
                .on_machine_auth(job_id, &payload, &state.services);
        }
        InboundEvent::LoggedOff { result } => {
            state.session.on_logged_off(result, &state.services);
            state.trades.close(&state.services);
        }
        InboundEvent::FriendsList { friends } => handle_friends_list(state, &friends),
        InboundEvent::FriendMessage {
            sender,
            entry_type,
            message,
        } => handle_friend_message(state, sender, entry_type, &message),
        InboundEvent::TradeSessionStart { other } => {
            let Some(me) = state.logged_on_id() else {
                debug!("Ignoring trade session with {} while not logged on", other);
                return;
            };
            if state.trades.on_session_start(me, other, &state.services).await {
                state.watchdog.arm(Instant::now());
            }
        }
        InboundEvent::TradeProposed { trade_id, other } => {
            let Some(me) = state.logged_on_id() else {
                debug!("Ignoring trade proposal from {} while not logged on", other);
                return;
            };
            state
                .trades
                .on_proposal(me, other, trade_id, &state.services)
                .await;
        }
        InboundEvent::TradeResult {
            trade_id,
            other,
            response,
        } => {
            debug!("Trade request {} to {}: {:?}", trade_id, other, response);
            if state.session.is_logged_on() {
                state.trades.on_result(response, &state.services);
            }
        }
        InboundEvent::Trade { event } => handle_trade_event(state, event),
    }
}

fn handle_trade_event(state: &mut BotState, event: TradeEvent) {
    if !state.session.is_logged_on() {
        debug!("Dropping trade event while not logged on");
        return;
    }
    if TradeEventKind::of(&event).is_some_and(|kind| kind.is_peer_action()) {
        state.watchdog.touch(Instant::now());
    }
    state.trades.on_trade_event(event, &state.services);
}

fn handle_friends_list(state: &mut BotState, friends: &[FriendEntry]) {
    for entry in friends {
        match state.friends.apply(entry) {
            FriendChange::Added { accept_invite } => {
                info!("Friend added: {}", entry.steam_id);
                if accept_invite {
                    if let Err(e) = state.services.client.add_friend(entry.steam_id) {
                        warn!("Failed to accept friend invite from {}: {}", entry.steam_id, e);
                    }
                }
            }
            FriendChange::Removed => info!("Friend removed: {}", entry.steam_id),
            FriendChange::Unchanged => {}
        }
    }
}

fn handle_friend_message(
    state: &mut BotState,
    sender: SteamId,
    entry_type: ChatEntryType,
    message: &str,
) {
    if !matches!(entry_type, ChatEntryType::ChatMsg | ChatEntryType::Emote) {
        return;
    }
    info!(
        "Chat message from {}{}: {}",
        sender,
        if state.is_admin(sender) { " (admin)" } else { "" },
        message
    );

    if let Some(handler) = state.trades.handlers_mut().get_mut(sender) {
        handler.on_friend_message(message, entry_type);
    }

    if let Some(reply) = &state.settings.chat_response {
        if let Err(e) = state
            .services
            .client
            .send_chat_message(sender, ChatEntryType::ChatMsg, reply)
        {
            warn!("Failed to reply to {}: {}", sender, e);
        }
    }
}

fn handle_command(state: &mut BotState, cmd: BotCommand) {
    match cmd {
        BotCommand::Quit => {}
        BotCommand::OpenTrade(peer) => {
            if !state.session.is_logged_on() {
                warn!("Cannot trade with {} while not logged on", peer);
                return;
            }
            if let Err(e) = state.trades.open_trade(peer, &state.services) {
                warn!("Cannot trade with {}: {}", peer, e);
            }
        }
        BotCommand::CloseTrade => {
            state.trades.close(&state.services);
            state.watchdog.disarm();
        }
        BotCommand::SetPersonaState(persona) => {
            if let Err(e) = state.services.client.set_persona_state(persona) {
                warn!("Failed to set persona state: {}", e);
                return;
            }
            state.services.status.send(UiUpdate::Persona {
                name: state.settings.persona_name.clone(),
                state: persona,
            });
        }
    }
}

fn check_watchdog(state: &mut BotState) {
    if !state.trades.is_active() {
        state.watchdog.disarm();
        return;
    }
    if let Some(reason) = state.watchdog.check(Instant::now()) {
        info!("Trade watchdog fired: {:?}", reason);
        state.trades.on_timeout(&state.services);
    }
    if !state.trades.is_active() {
        state.watchdog.disarm();
    }
}
