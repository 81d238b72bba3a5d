// Collaborator seams: the protocol client, web authentication, inventory and
// schema lookups, and the per-trade negotiation engine.
//
// The dispatch loop only ever talks to these traits. The binary crate wires
// them to the network; tests wire them to recording fakes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tradebot_core::inventory::{InventoryFetch, ItemSchema};
use tradebot_core::protocol::{
    ChatEntryType, LogOnDetails, MachineAuthResponse, PersonaState, SteamId, TradeRequestId,
};

use crate::status::StatusSink;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol client is not connected")]
    Closed,

    #[error("{operation} failed: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum WebAuthError {
    #[error("web authentication rejected: {0}")]
    Rejected(String),

    #[error("web authentication transport error: {0}")]
    Transport(String),

    #[error("web authentication timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory request for {owner} failed: {message}")]
    Request { owner: SteamId, message: String },

    #[error("inventory API returned status {status} for {owner}")]
    Status { owner: SteamId, status: i64 },

    #[error("malformed inventory response for {owner}: {message}")]
    Malformed { owner: SteamId, message: String },
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema request failed: {0}")]
    Request(String),

    #[error("malformed schema response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no web session attached")]
    NoWebSession,

    #[error("negotiation engine failed to start: {0}")]
    Start(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Outbound half of the protocol client.
///
/// Every call only enqueues the request; results come back later as
/// `InboundEvent`s on the dispatch channel.
pub trait SteamClient: Send + Sync {
    fn connect(&self) -> Result<(), ClientError>;
    fn disconnect(&self) -> Result<(), ClientError>;
    fn log_on(&self, details: &LogOnDetails) -> Result<(), ClientError>;
    fn send_machine_auth_response(&self, response: &MachineAuthResponse)
        -> Result<(), ClientError>;
    fn set_persona_state(&self, state: PersonaState) -> Result<(), ClientError>;
    fn set_persona_name(&self, name: &str) -> Result<(), ClientError>;
    fn add_friend(&self, id: SteamId) -> Result<(), ClientError>;
    fn send_chat_message(
        &self,
        to: SteamId,
        entry_type: ChatEntryType,
        message: &str,
    ) -> Result<(), ClientError>;
    fn request_trade(&self, with: SteamId) -> Result<(), ClientError>;
    fn respond_to_trade(&self, trade_id: TradeRequestId, accept: bool)
        -> Result<(), ClientError>;
}

/// Cookies obtained from the web handshake, needed by the negotiation engine.
#[derive(Clone, PartialEq, Eq)]
pub struct WebSession {
    pub session_id: String,
    pub token: String,
}

impl fmt::Debug for WebSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSession")
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait WebAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        login_key: &str,
        unique_id: u32,
    ) -> Result<WebSession, WebAuthError>;
}

#[async_trait]
pub trait InventoryFetcher: Send + Sync {
    async fn fetch(&self, owner: SteamId) -> Result<InventoryFetch, InventoryError>;
}

#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    async fn fetch_schema(&self) -> Result<ItemSchema, SchemaError>;
}

/// Drives a single trade window once the session is established.
pub trait NegotiationEngine: Send + Sync {
    fn attach_web_session(&self, session: WebSession);
    fn start(&self, me: SteamId, other: SteamId) -> Result<(), EngineError>;
    /// Stop polling the current trade. A no-op when nothing is running.
    fn stop(&self);
}

/// Everything the dispatch loop needs to reach the outside world.
#[derive(Clone)]
pub struct Services {
    pub client: Arc<dyn SteamClient>,
    pub web_auth: Arc<dyn WebAuthenticator>,
    pub inventories: Arc<dyn InventoryFetcher>,
    pub schema: Arc<dyn SchemaFetcher>,
    pub engine: Arc<dyn NegotiationEngine>,
    pub status: StatusSink,
}
