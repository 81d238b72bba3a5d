// Trade session orchestration: at most one trade at a time, inventory
// gating, and per-session listener wiring.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use tradebot_core::inventory::{Inventory, InventoryFetch, ItemSchema};
use tradebot_core::protocol::{ChatEntryType, SteamId, TradeEvent, TradeRequestId, TradeResponse};

use crate::client::Services;
use crate::handler::{HandlerRegistry, PeerHandler, TimeoutAction};
use crate::status::UiUpdate;

pub const DECLINE_FETCH_FAILED: &str = "Trade declined. Could not correctly fetch your backpack.";
pub const DECLINE_PRIVATE_BACKPACK: &str = "Trade declined. Your backpack cannot be private.";
pub const START_PEER_FETCH_FAILED: &str = "Trade failed. Could not correctly fetch your backpack. Either the inventory is inaccessible or your backpack is private.";
pub const START_OWN_FETCH_FAILED: &str = "Trade failed. Could not correctly fetch my backpack.";

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("no handler registered for peer {0}")]
    UnknownPeer(SteamId),

    #[error("already trading with {0}")]
    AlreadyTrading(SteamId),
}

// ---------------------------------------------------------------------------
// Listener wiring
// ---------------------------------------------------------------------------

/// Engine event kinds a trade session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeEventKind {
    Close,
    Error,
    AfterInit,
    UserAddItem,
    UserRemoveItem,
    Message,
    UserSetReady,
    UserAccept,
}

impl TradeEventKind {
    pub const ALL: [TradeEventKind; 8] = [
        TradeEventKind::Close,
        TradeEventKind::Error,
        TradeEventKind::AfterInit,
        TradeEventKind::UserAddItem,
        TradeEventKind::UserRemoveItem,
        TradeEventKind::Message,
        TradeEventKind::UserSetReady,
        TradeEventKind::UserAccept,
    ];

    /// Listener kind for an engine event. `TimedOut` and `Ended` are handled
    /// by the orchestrator itself and have none.
    pub fn of(event: &TradeEvent) -> Option<Self> {
        match event {
            TradeEvent::Initialized => Some(TradeEventKind::AfterInit),
            TradeEvent::Closed => Some(TradeEventKind::Close),
            TradeEvent::Error { .. } => Some(TradeEventKind::Error),
            TradeEvent::ItemAdded { .. } => Some(TradeEventKind::UserAddItem),
            TradeEvent::ItemRemoved { .. } => Some(TradeEventKind::UserRemoveItem),
            TradeEvent::Message { .. } => Some(TradeEventKind::Message),
            TradeEvent::ReadyChanged { .. } => Some(TradeEventKind::UserSetReady),
            TradeEvent::Accepted => Some(TradeEventKind::UserAccept),
            TradeEvent::TimedOut | TradeEvent::Ended => None,
        }
    }

    /// Whether this kind is an action taken by the peer.
    pub fn is_peer_action(&self) -> bool {
        matches!(
            self,
            TradeEventKind::UserAddItem
                | TradeEventKind::UserRemoveItem
                | TradeEventKind::Message
                | TradeEventKind::UserSetReady
                | TradeEventKind::UserAccept
        )
    }
}

/// Receipt for one subscription; only the matching token can remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken {
    id: u64,
    kind: TradeEventKind,
}

impl ListenerToken {
    pub fn kind(&self) -> TradeEventKind {
        self.kind
    }
}

/// Which peer's handler receives each engine event kind.
#[derive(Debug, Default)]
pub struct ListenerTable {
    next_id: u64,
    listeners: HashMap<TradeEventKind, (ListenerToken, SteamId)>,
}

impl ListenerTable {
    /// Subscribe `peer` to every event kind.
    fn subscribe_all(&mut self, peer: SteamId) -> Vec<ListenerToken> {
        TradeEventKind::ALL
            .iter()
            .map(|&kind| {
                self.next_id += 1;
                let token = ListenerToken {
                    id: self.next_id,
                    kind,
                };
                if let Some((stale, owner)) = self.listeners.insert(kind, (token, peer)) {
                    warn!(
                        "Replaced stale {:?} listener {} owned by {}",
                        kind, stale.id, owner
                    );
                }
                token
            })
            .collect()
    }

    fn unsubscribe(&mut self, token: ListenerToken) -> bool {
        match self.listeners.get(&token.kind) {
            Some((current, _)) if *current == token => {
                self.listeners.remove(&token.kind);
                true
            }
            _ => false,
        }
    }

    pub fn listener(&self, kind: TradeEventKind) -> Option<SteamId> {
        self.listeners.get(&kind).map(|(_, peer)| *peer)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradePhase {
    /// Engine started, trade window not yet initialized.
    Pending,
    Active,
}

/// The single live trade.
#[derive(Debug)]
pub struct TradeSession {
    peer: SteamId,
    phase: TradePhase,
    own_inventory: Inventory,
    peer_inventory: Inventory,
    tokens: Vec<ListenerToken>,
}

impl TradeSession {
    pub fn peer(&self) -> SteamId {
        self.peer
    }

    pub fn phase(&self) -> TradePhase {
        self.phase
    }

    pub fn own_inventory(&self) -> &Inventory {
        &self.own_inventory
    }

    pub fn peer_inventory(&self) -> &Inventory {
        &self.peer_inventory
    }

    pub fn tokens(&self) -> &[ListenerToken] {
        &self.tokens
    }
}

enum FetchFailure {
    Own,
    Peer,
    PeerRestricted,
}

async fn fetch_inventories(
    me: SteamId,
    peer: SteamId,
    services: &Services,
) -> Result<(Inventory, Inventory), FetchFailure> {
    let peer_inventory = match services.inventories.fetch(peer).await {
        Ok(InventoryFetch::Available(inventory)) => inventory,
        Ok(InventoryFetch::Restricted) => return Err(FetchFailure::PeerRestricted),
        Err(e) => {
            warn!("Could not fetch backpack of {}: {}", peer, e);
            return Err(FetchFailure::Peer);
        }
    };
    let own_inventory = match services.inventories.fetch(me).await {
        Ok(InventoryFetch::Available(inventory)) => inventory,
        Ok(InventoryFetch::Restricted) => {
            warn!("Own backpack is restricted");
            return Err(FetchFailure::Own);
        }
        Err(e) => {
            warn!("Could not fetch own backpack: {}", e);
            return Err(FetchFailure::Own);
        }
    };
    Ok((own_inventory, peer_inventory))
}

fn tell(services: &Services, peer: SteamId, message: &str) {
    info!("To {}: {}", peer, message);
    if let Err(e) = services
        .client
        .send_chat_message(peer, ChatEntryType::ChatMsg, message)
    {
        warn!("Failed to message {}: {}", peer, e);
    }
}

fn forward(handler: &mut dyn PeerHandler, event: &TradeEvent) {
    match event {
        TradeEvent::Initialized => handler.on_trade_init(),
        TradeEvent::Closed => handler.on_trade_close(),
        TradeEvent::Error { message } => handler.on_trade_error(message),
        TradeEvent::ItemAdded { item } => handler.on_trade_add_item(item),
        TradeEvent::ItemRemoved { item } => handler.on_trade_remove_item(item),
        TradeEvent::Message { text } => handler.on_trade_message(text),
        TradeEvent::ReadyChanged { ready } => handler.on_trade_ready(*ready),
        TradeEvent::Accepted => handler.on_trade_accept(),
        TradeEvent::TimedOut | TradeEvent::Ended => {}
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns the current trade, its listeners and the per-peer handlers.
pub struct TradeOrchestrator {
    current: Option<TradeSession>,
    listeners: ListenerTable,
    handlers: HandlerRegistry,
    schema: Option<Arc<ItemSchema>>,
}

impl TradeOrchestrator {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            current: None,
            listeners: ListenerTable::default(),
            handlers,
            schema: None,
        }
    }

    /// Schema handed to each handler when its trade starts.
    pub fn set_schema(&mut self, schema: Arc<ItemSchema>) {
        self.schema = Some(schema);
    }

    pub fn current(&self) -> Option<&TradeSession> {
        self.current.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn listeners(&self) -> &ListenerTable {
        &self.listeners
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    /// Send a trade request to `peer`.
    pub fn open_trade(&mut self, peer: SteamId, services: &Services) -> Result<(), TradeError> {
        if let Some(session) = &self.current {
            return Err(TradeError::AlreadyTrading(session.peer));
        }
        info!("Requesting trade with {}", peer);
        if let Err(e) = services.client.request_trade(peer) {
            warn!("Trade request to {} failed: {}", peer, e);
        }
        Ok(())
    }

    /// A trade window opened with `peer`. Returns whether a session was
    /// established.
    pub async fn on_session_start(&mut self, me: SteamId, peer: SteamId, services: &Services) -> bool {
        if let Some(session) = &self.current {
            info!(
                "Ignoring trade session with {}: already trading with {}",
                peer, session.peer
            );
            return false;
        }

        let (own_inventory, peer_inventory) = match fetch_inventories(me, peer, services).await {
            Ok(pair) => pair,
            Err(FetchFailure::Own) => {
                tell(services, peer, START_OWN_FETCH_FAILED);
                return false;
            }
            Err(FetchFailure::Peer) | Err(FetchFailure::PeerRestricted) => {
                tell(services, peer, START_PEER_FETCH_FAILED);
                return false;
            }
        };

        match self.handlers.resolve(peer) {
            Ok(handler) => {
                if let Some(schema) = &self.schema {
                    handler.on_schema(Arc::clone(schema));
                }
            }
            Err(e) => {
                warn!("Cannot start trade with {}: {}", peer, e);
                return false;
            }
        }

        if let Err(e) = services.engine.start(me, peer) {
            warn!("Cannot start trade with {}: {}", peer, e);
            return false;
        }

        let tokens = self.listeners.subscribe_all(peer);
        self.current = Some(TradeSession {
            peer,
            phase: TradePhase::Pending,
            own_inventory,
            peer_inventory,
            tokens,
        });
        services.status.send(UiUpdate::TradeOpened { peer });
        info!("Trade session started with {}", peer);
        true
    }

    /// Decide on an incoming proposal and answer it.
    pub async fn on_proposal(
        &mut self,
        me: SteamId,
        peer: SteamId,
        trade_id: TradeRequestId,
        services: &Services,
    ) -> bool {
        let accept = self.decide_proposal(me, peer, services).await;
        info!(
            "{} trade proposal {} from {}",
            if accept { "Accepting" } else { "Declining" },
            trade_id,
            peer
        );
        if let Err(e) = services.client.respond_to_trade(trade_id, accept) {
            warn!("Failed to answer trade proposal {}: {}", trade_id, e);
        }
        accept
    }

    async fn decide_proposal(&mut self, me: SteamId, peer: SteamId, services: &Services) -> bool {
        match fetch_inventories(me, peer, services).await {
            Ok(_) => {}
            Err(FetchFailure::PeerRestricted) => {
                tell(services, peer, DECLINE_PRIVATE_BACKPACK);
                return false;
            }
            Err(FetchFailure::Own) | Err(FetchFailure::Peer) => {
                tell(services, peer, DECLINE_FETCH_FAILED);
                return false;
            }
        }

        if let Some(session) = &self.current {
            debug!("Busy trading with {}", session.peer);
            return false;
        }

        match self.handlers.resolve(peer) {
            Ok(handler) => handler.on_trade_request(),
            Err(e) => {
                warn!("Declining proposal: {}", e);
                false
            }
        }
    }

    /// Result of a trade request the bot sent.
    pub fn on_result(&mut self, response: TradeResponse, services: &Services) {
        if response == TradeResponse::Accepted {
            info!("Trade request accepted");
            return;
        }
        info!("Trade request failed: {:?}", response);
        self.close(services);
    }

    /// Ask the handler whether an idle or overrunning trade should close.
    pub fn on_timeout(&mut self, services: &Services) {
        let Some(session) = &self.current else {
            return;
        };
        let peer = session.peer;
        let action = match self.handlers.get_mut(peer) {
            Some(handler) => handler.on_trade_timeout(),
            None => TimeoutAction::Close,
        };
        match action {
            TimeoutAction::Close => {
                info!("Trade with {} timed out, closing", peer);
                self.close(services);
            }
            TimeoutAction::KeepOpen => debug!("Handler kept timed-out trade with {} open", peer),
        }
    }

    /// Route an engine event to the subscribed handler.
    pub fn on_trade_event(&mut self, event: TradeEvent, services: &Services) {
        match event {
            TradeEvent::TimedOut => {
                self.on_timeout(services);
                return;
            }
            TradeEvent::Ended => {
                debug!("Negotiation engine ended the trade");
                self.close(services);
                return;
            }
            _ => {}
        }

        let Some(kind) = TradeEventKind::of(&event) else {
            return;
        };
        let Some(peer) = self.listeners.listener(kind) else {
            debug!("No listener for {:?}, dropping event", kind);
            return;
        };

        if kind == TradeEventKind::AfterInit {
            if let Some(session) = self.current.as_mut() {
                session.phase = TradePhase::Active;
            }
        }

        let forwarded = match self.handlers.get_mut(peer) {
            Some(handler) => panic::catch_unwind(AssertUnwindSafe(|| forward(&mut **handler, &event))),
            None => {
                warn!("Listener for {} has no handler", peer);
                Ok(())
            }
        };

        // A terminal event tears the session down even if the handler panicked.
        if matches!(kind, TradeEventKind::Close | TradeEventKind::Error) {
            self.close(services);
        }
        if let Err(payload) = forwarded {
            panic::resume_unwind(payload);
        }
    }

    /// Tear down the current trade: unwire listeners, stop the engine, clear
    /// the session. Safe to call when no trade is open.
    pub fn close(&mut self, services: &Services) {
        let Some(session) = self.current.as_ref() else {
            return;
        };
        for token in &session.tokens {
            if !self.listeners.unsubscribe(*token) {
                warn!("Listener {:?} was already removed", token.kind);
            }
        }
        services.engine.stop();

        let peer = session.peer;
        self.current = None;
        services.status.send(UiUpdate::TradeClosed { peer });
        info!("Trade session with {} closed", peer);
    }
}
