// Protocol-level types exchanged with the remote trading network.
//
// The bot never sees the wire encoding of the remote service. A protocol
// client (see the bridge adapter in the binary crate) turns whatever it
// receives into `InboundEvent`s and executes the outbound operations on the
// bot's behalf. Everything here is serde-friendly so the bridge can carry it
// as JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sentry::SentryHash;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// 64-bit account identifier of a peer (or of the bot itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SteamId(pub u64);

impl fmt::Display for SteamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SteamId {
    fn from(value: u64) -> Self {
        SteamId(value)
    }
}

/// Server job the bot must reference when answering a machine-auth push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

/// Identifier of an incoming trade proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeRequestId(pub u32);

impl fmt::Display for TradeRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Result codes and enumerations
// ---------------------------------------------------------------------------

/// Result code attached to connect, logon and logoff notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EResult {
    Ok,
    Fail,
    NoConnection,
    InvalidPassword,
    LoggedInElsewhere,
    Timeout,
    ServiceUnavailable,
    RateLimitExceeded,
    AccountLogonDenied,
    InvalidLoginAuthCode,
    AccountDisabled,
}

impl fmt::Display for EResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Relationship carried by a friends-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendRelationship {
    None,
    Blocked,
    PendingInvitee,
    RequestInitiator,
    Friend,
    Ignored,
}

/// Kind of a chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEntryType {
    ChatMsg,
    Typing,
    InviteGame,
    Emote,
    LeftConversation,
}

/// Persona (presence) state shown to other users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaState {
    Offline,
    Online,
    Busy,
    Away,
    Snooze,
    LookingToTrade,
    LookingToPlay,
}

/// Response to a trade request the bot sent or answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeResponse {
    Accepted,
    Declined,
    TradeBannedInitiator,
    TradeBannedTarget,
    TargetAlreadyTrading,
    Disabled,
    NotLoggedIn,
    Cancel,
    TooSoon,
    ConnectionFailed,
    NoResponse,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Credentials submitted on every logon attempt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOnDetails {
    pub username: String,
    pub password: String,
    /// Out-of-band verification code, filled in after a guard-required result.
    #[serde(default)]
    pub auth_code: Option<String>,
    /// Device-trust hash of the last persisted sentry payload.
    #[serde(default)]
    pub sentry_hash: Option<SentryHash>,
}

impl LogOnDetails {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            auth_code: None,
            sentry_hash: None,
        }
    }
}

// Hand-written so the password never reaches the logs.
impl fmt::Debug for LogOnDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOnDetails")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth_code", &self.auth_code.as_ref().map(|_| "<set>"))
            .field("sentry_hash", &self.sentry_hash)
            .finish()
    }
}

/// Device-auth material pushed by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAuthPayload {
    pub file_name: String,
    pub offset: u32,
    pub bytes_to_write: u32,
    pub data: Vec<u8>,
    #[serde(default)]
    pub one_time_password: Option<String>,
}

/// Acknowledgement for a machine-auth push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAuthResponse {
    pub job_id: JobId,
    pub file_name: String,
    pub bytes_written: u32,
    pub file_size: u32,
    pub offset: u32,
    pub sentry_hash: SentryHash,
    pub one_time_password: Option<String>,
    /// OS error code from writing the sentry file; always 0 on success.
    pub last_error: u32,
    pub result: EResult,
}

/// A single friends-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendEntry {
    pub steam_id: SteamId,
    pub relationship: FriendRelationship,
}

/// An item placed in (or removed from) the trade window by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeItem {
    pub id: u64,
    pub defindex: u32,
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// Events produced by the running negotiation engine for the current trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TradeEvent {
    /// The trade window finished initializing.
    Initialized,
    /// The trade was closed (completed or cancelled remotely).
    Closed,
    Error { message: String },
    ItemAdded { item: TradeItem },
    ItemRemoved { item: TradeItem },
    Message { text: String },
    ReadyChanged { ready: bool },
    Accepted,
    /// The engine's own inactivity watchdog fired.
    TimedOut,
    /// The engine stopped polling; the trade is over.
    Ended,
}

/// Every message the protocol client can deliver to the bot, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Connected { result: EResult },
    Disconnected,
    LoggedOn {
        result: EResult,
        #[serde(default)]
        steam_id: Option<SteamId>,
    },
    LoginKey { login_key: String, unique_id: u32 },
    MachineAuth { job_id: JobId, payload: MachineAuthPayload },
    FriendsList { friends: Vec<FriendEntry> },
    FriendMessage {
        sender: SteamId,
        entry_type: ChatEntryType,
        message: String,
    },
    TradeSessionStart { other: SteamId },
    TradeProposed { trade_id: TradeRequestId, other: SteamId },
    TradeResult {
        trade_id: TradeRequestId,
        other: SteamId,
        response: TradeResponse,
    },
    LoggedOff { result: EResult },
    Trade { event: TradeEvent },
}

impl InboundEvent {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Connected { .. } => "connected",
            InboundEvent::Disconnected => "disconnected",
            InboundEvent::LoggedOn { .. } => "logged_on",
            InboundEvent::LoginKey { .. } => "login_key",
            InboundEvent::MachineAuth { .. } => "machine_auth",
            InboundEvent::FriendsList { .. } => "friends_list",
            InboundEvent::FriendMessage { .. } => "friend_message",
            InboundEvent::TradeSessionStart { .. } => "trade_session_start",
            InboundEvent::TradeProposed { .. } => "trade_proposed",
            InboundEvent::TradeResult { .. } => "trade_result",
            InboundEvent::LoggedOff { .. } => "logged_off",
            InboundEvent::Trade { .. } => "trade",
        }
    }
}
