// Default per-peer behavior shipped with the binary: trade with admins only,
// and log everything that happens in the trade window.

use std::sync::Arc;

use tracing::info;

use tradebot_app::handler::{PeerHandler, TimeoutAction};
use tradebot_core::inventory::ItemSchema;
use tradebot_core::protocol::{ChatEntryType, SteamId, TradeItem};

pub struct AdminOnlyHandler {
    peer: SteamId,
    is_admin: bool,
    items_offered: usize,
    schema: Option<Arc<ItemSchema>>,
}

impl AdminOnlyHandler {
    pub fn new(peer: SteamId, is_admin: bool) -> Self {
        Self {
            peer,
            is_admin,
            items_offered: 0,
            schema: None,
        }
    }

    pub fn items_offered(&self) -> usize {
        self.items_offered
    }

    fn item_name(&self, item: &TradeItem) -> String {
        self.schema
            .as_ref()
            .and_then(|schema| schema.name_of(item.defindex))
            .map(str::to_string)
            .unwrap_or_else(|| format!("defindex {}", item.defindex))
    }
}

impl PeerHandler for AdminOnlyHandler {
    fn on_trade_request(&mut self) -> bool {
        info!(
            "Trade proposal from {} ({})",
            self.peer,
            if self.is_admin { "admin" } else { "not an admin" }
        );
        self.is_admin
    }

    fn on_trade_close(&mut self) {
        info!("[{}] trade closed", self.peer);
        self.items_offered = 0;
    }

    fn on_trade_error(&mut self, message: &str) {
        info!("[{}] trade error: {}", self.peer, message);
        self.items_offered = 0;
    }

    fn on_trade_init(&mut self) {
        info!("[{}] trade window ready", self.peer);
        self.items_offered = 0;
    }

    fn on_trade_add_item(&mut self, item: &TradeItem) {
        self.items_offered += 1;
        info!("[{}] added {} ({})", self.peer, self.item_name(item), item.id);
    }

    fn on_trade_remove_item(&mut self, item: &TradeItem) {
        self.items_offered = self.items_offered.saturating_sub(1);
        info!("[{}] removed {} ({})", self.peer, self.item_name(item), item.id);
    }

    fn on_trade_message(&mut self, message: &str) {
        info!("[{}] says: {}", self.peer, message);
    }

    fn on_trade_ready(&mut self, ready: bool) {
        info!("[{}] ready: {}", self.peer, ready);
    }

    fn on_trade_accept(&mut self) {
        info!(
            "[{}] accepted with {} item(s) offered",
            self.peer, self.items_offered
        );
    }

    fn on_trade_timeout(&mut self) -> TimeoutAction {
        info!("[{}] trade timed out", self.peer);
        TimeoutAction::Close
    }

    fn on_friend_message(&mut self, message: &str, entry_type: ChatEntryType) {
        info!("[{}] {:?}: {}", self.peer, entry_type, message);
    }

    fn on_schema(&mut self, schema: Arc<ItemSchema>) {
        self.schema = Some(schema);
    }
}
