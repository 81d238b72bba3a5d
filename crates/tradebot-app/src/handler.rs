// Per-peer trade behavior and the registry that owns it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tradebot_core::inventory::ItemSchema;
use tradebot_core::protocol::{ChatEntryType, SteamId, TradeItem};

use crate::trade::TradeError;

/// What to do when a trade goes idle or overruns its time limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    Close,
    KeepOpen,
}

/// Trading logic for one counterparty.
///
/// All callbacks run on the dispatch task, one at a time. A handler is created
/// once per peer and reused for every later trade with that peer.
pub trait PeerHandler: Send {
    /// Return `true` to accept an incoming trade proposal.
    fn on_trade_request(&mut self) -> bool;
    fn on_trade_close(&mut self);
    fn on_trade_error(&mut self, message: &str);
    fn on_trade_init(&mut self);
    fn on_trade_add_item(&mut self, item: &TradeItem);
    fn on_trade_remove_item(&mut self, item: &TradeItem);
    fn on_trade_message(&mut self, message: &str);
    fn on_trade_ready(&mut self, ready: bool);
    fn on_trade_accept(&mut self);
    fn on_trade_timeout(&mut self) -> TimeoutAction;

    fn on_friend_message(&mut self, _message: &str, _entry_type: ChatEntryType) {}

    /// Item definitions, handed over before each trade once downloaded.
    fn on_schema(&mut self, _schema: Arc<ItemSchema>) {}
}

pub type HandlerFactory = Box<dyn FnMut(SteamId) -> Box<dyn PeerHandler> + Send>;

/// Maps peers to their handlers.
///
/// Without a factory only explicitly registered peers can trade; any other
/// peer resolves to [`TradeError::UnknownPeer`].
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<SteamId, Box<dyn PeerHandler>>,
    factory: Option<HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that builds a handler the first time a peer shows up.
    pub fn with_factory(
        factory: impl FnMut(SteamId) -> Box<dyn PeerHandler> + Send + 'static,
    ) -> Self {
        Self {
            handlers: HashMap::new(),
            factory: Some(Box::new(factory)),
        }
    }

    /// Install a handler for `peer`, returning the one it replaced.
    pub fn register(
        &mut self,
        peer: SteamId,
        handler: Box<dyn PeerHandler>,
    ) -> Option<Box<dyn PeerHandler>> {
        self.handlers.insert(peer, handler)
    }

    pub fn contains(&self, peer: SteamId) -> bool {
        self.handlers.contains_key(&peer)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Existing handler for `peer`, never creating one.
    pub fn get_mut(&mut self, peer: SteamId) -> Option<&mut Box<dyn PeerHandler>> {
        self.handlers.get_mut(&peer)
    }

    /// Handler for `peer`, created through the factory on first use.
    pub fn resolve(&mut self, peer: SteamId) -> Result<&mut Box<dyn PeerHandler>, TradeError> {
        match self.handlers.entry(peer) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let factory = self.factory.as_mut().ok_or(TradeError::UnknownPeer(peer))?;
                Ok(entry.insert(factory(peer)))
            }
        }
    }
}
