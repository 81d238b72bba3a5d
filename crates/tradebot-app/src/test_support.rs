// Recording fakes shared by the unit tests in this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tradebot_core::inventory::{Inventory, InventoryFetch, InventoryItem, ItemSchema, SchemaItem};
use tradebot_core::protocol::{
    ChatEntryType, LogOnDetails, MachineAuthResponse, PersonaState, SteamId, TradeItem,
    TradeRequestId,
};

use crate::client::{
    ClientError, EngineError, InventoryError, InventoryFetcher, NegotiationEngine, SchemaError,
    SchemaFetcher, Services, SteamClient, WebAuthError, WebAuthenticator, WebSession,
};
use crate::handler::{PeerHandler, TimeoutAction};
use crate::status::StatusSink;

pub const BOT: SteamId = SteamId(76561198000000001);
pub const PEER: SteamId = SteamId(76561198000000002);
pub const OTHER_PEER: SteamId = SteamId(76561198000000003);

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    Connect,
    Disconnect,
    LogOn(LogOnDetails),
    MachineAuth(MachineAuthResponse),
    PersonaState(PersonaState),
    PersonaName(String),
    AddFriend(SteamId),
    Chat {
        to: SteamId,
        entry_type: ChatEntryType,
        message: String,
    },
    RequestTrade(SteamId),
    RespondToTrade {
        trade_id: TradeRequestId,
        accept: bool,
    },
}

#[derive(Default)]
pub struct FakeClient {
    calls: Mutex<Vec<ClientCall>>,
}

impl FakeClient {
    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, pred: impl Fn(&ClientCall) -> bool) -> usize {
        self.calls().iter().filter(|&c| pred(c)).count()
    }

    pub fn logons(&self) -> Vec<LogOnDetails> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::LogOn(details) => Some(details),
                _ => None,
            })
            .collect()
    }

    pub fn chats_to(&self, peer: SteamId) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::Chat { to, message, .. } if to == peer => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn trade_responses(&self) -> Vec<bool> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::RespondToTrade { accept, .. } => Some(accept),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ClientCall) -> Result<(), ClientError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl SteamClient for FakeClient {
    fn connect(&self) -> Result<(), ClientError> {
        self.record(ClientCall::Connect)
    }

    fn disconnect(&self) -> Result<(), ClientError> {
        self.record(ClientCall::Disconnect)
    }

    fn log_on(&self, details: &LogOnDetails) -> Result<(), ClientError> {
        self.record(ClientCall::LogOn(details.clone()))
    }

    fn send_machine_auth_response(
        &self,
        response: &MachineAuthResponse,
    ) -> Result<(), ClientError> {
        self.record(ClientCall::MachineAuth(response.clone()))
    }

    fn set_persona_state(&self, state: PersonaState) -> Result<(), ClientError> {
        self.record(ClientCall::PersonaState(state))
    }

    fn set_persona_name(&self, name: &str) -> Result<(), ClientError> {
        self.record(ClientCall::PersonaName(name.to_string()))
    }

    fn add_friend(&self, id: SteamId) -> Result<(), ClientError> {
        self.record(ClientCall::AddFriend(id))
    }

    fn send_chat_message(
        &self,
        to: SteamId,
        entry_type: ChatEntryType,
        message: &str,
    ) -> Result<(), ClientError> {
        self.record(ClientCall::Chat {
            to,
            entry_type,
            message: message.to_string(),
        })
    }

    fn request_trade(&self, with: SteamId) -> Result<(), ClientError> {
        self.record(ClientCall::RequestTrade(with))
    }

    fn respond_to_trade(&self, trade_id: TradeRequestId, accept: bool) -> Result<(), ClientError> {
        self.record(ClientCall::RespondToTrade { trade_id, accept })
    }
}

/// Fails the first `failures` handshakes, then succeeds.
#[derive(Default)]
pub struct FakeWebAuth {
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FakeWebAuth {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebAuthenticator for FakeWebAuth {
    async fn authenticate(
        &self,
        _login_key: &str,
        _unique_id: u32,
    ) -> Result<WebSession, WebAuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(WebAuthError::Transport("connection reset".into()));
        }
        Ok(WebSession {
            session_id: "session".into(),
            token: "token".into(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpack {
    Public,
    Private,
    Broken,
}

#[derive(Default)]
pub struct FakeInventories {
    scripted: Mutex<HashMap<SteamId, Backpack>>,
    fetched: Mutex<Vec<SteamId>>,
}

impl FakeInventories {
    pub fn set(&self, owner: SteamId, backpack: Backpack) {
        self.scripted.lock().unwrap().insert(owner, backpack);
    }

    pub fn fetched(&self) -> Vec<SteamId> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl InventoryFetcher for FakeInventories {
    async fn fetch(&self, owner: SteamId) -> Result<InventoryFetch, InventoryError> {
        self.fetched.lock().unwrap().push(owner);
        let backpack = self
            .scripted
            .lock()
            .unwrap()
            .get(&owner)
            .copied()
            .unwrap_or(Backpack::Public);
        match backpack {
            Backpack::Public => Ok(InventoryFetch::Available(Inventory::new(
                owner,
                vec![InventoryItem {
                    id: owner.0 % 1000,
                    original_id: owner.0 % 1000,
                    defindex: 5021,
                    level: 5,
                    quality: 6,
                }],
            ))),
            Backpack::Private => Ok(InventoryFetch::Restricted),
            Backpack::Broken => Err(InventoryError::Request {
                owner,
                message: "timed out".into(),
            }),
        }
    }
}

#[derive(Default)]
pub struct FakeSchema {
    fail: AtomicBool,
    calls: AtomicU32,
}

impl FakeSchema {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaFetcher for FakeSchema {
    async fn fetch_schema(&self) -> Result<ItemSchema, SchemaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SchemaError::Request("503".into()));
        }
        Ok(ItemSchema::from_items(vec![SchemaItem {
            defindex: 5021,
            name: "Mann Co. Supply Crate Key".into(),
        }]))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Attach(WebSession),
    Start { me: SteamId, other: SteamId },
    Stop,
}

#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<EngineCall>>,
    fail_start: AtomicBool,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::Start { .. }))
            .count()
    }

    pub fn stops(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::Stop))
            .count()
    }
}

impl NegotiationEngine for FakeEngine {
    fn attach_web_session(&self, session: WebSession) {
        self.calls.lock().unwrap().push(EngineCall::Attach(session));
    }

    fn start(&self, me: SteamId, other: SteamId) -> Result<(), EngineError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Start("window refused".into()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::Start { me, other });
        Ok(())
    }

    fn stop(&self) {
        self.calls.lock().unwrap().push(EngineCall::Stop);
    }
}

/// Handles to every fake behind a `Services` bundle.
pub struct Fakes {
    pub client: Arc<FakeClient>,
    pub web_auth: Arc<FakeWebAuth>,
    pub inventories: Arc<FakeInventories>,
    pub schema: Arc<FakeSchema>,
    pub engine: Arc<FakeEngine>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::with_web_auth(FakeWebAuth::default())
    }

    pub fn with_web_auth(web_auth: FakeWebAuth) -> Self {
        Self {
            client: Arc::new(FakeClient::default()),
            web_auth: Arc::new(web_auth),
            inventories: Arc::new(FakeInventories::default()),
            schema: Arc::new(FakeSchema::default()),
            engine: Arc::new(FakeEngine::default()),
        }
    }

    pub fn services(&self) -> Services {
        self.services_with(StatusSink::detached())
    }

    pub fn services_with(&self, status: StatusSink) -> Services {
        Services {
            client: self.client.clone(),
            web_auth: self.web_auth.clone(),
            inventories: self.inventories.clone(),
            schema: self.schema.clone(),
            engine: self.engine.clone(),
            status,
        }
    }
}

/// Peer handler that writes every callback to a shared log.
#[derive(Clone)]
pub struct RecordingHandler {
    pub log: Arc<Mutex<Vec<String>>>,
    pub schema: Arc<Mutex<Option<Arc<ItemSchema>>>>,
    pub accept_requests: bool,
    pub on_timeout: TimeoutAction,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            schema: Arc::new(Mutex::new(None)),
            accept_requests: true,
            on_timeout: TimeoutAction::Close,
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

impl PeerHandler for RecordingHandler {
    fn on_trade_request(&mut self) -> bool {
        self.push("request");
        self.accept_requests
    }

    fn on_trade_close(&mut self) {
        self.push("close");
    }

    fn on_trade_error(&mut self, message: &str) {
        self.push(format!("error:{message}"));
    }

    fn on_trade_init(&mut self) {
        self.push("init");
    }

    fn on_trade_add_item(&mut self, item: &TradeItem) {
        self.push(format!("add:{}", item.id));
    }

    fn on_trade_remove_item(&mut self, item: &TradeItem) {
        self.push(format!("remove:{}", item.id));
    }

    fn on_trade_message(&mut self, message: &str) {
        self.push(format!("message:{message}"));
    }

    fn on_trade_ready(&mut self, ready: bool) {
        self.push(format!("ready:{ready}"));
    }

    fn on_trade_accept(&mut self) {
        self.push("accept");
    }

    fn on_trade_timeout(&mut self) -> TimeoutAction {
        self.push("timeout");
        self.on_timeout
    }

    fn on_friend_message(&mut self, message: &str, _entry_type: ChatEntryType) {
        self.push(format!("friend:{message}"));
    }

    fn on_schema(&mut self, schema: Arc<ItemSchema>) {
        *self.schema.lock().unwrap() = Some(schema);
    }
}
