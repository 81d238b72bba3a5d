// WebSocket client for the protocol bridge.
//
// The bridge is a separate process that holds the actual Steam connection.
// We send it `BridgeCommand`s as JSON text frames and it answers with
// `BridgeFrame`s: inbound events for the dispatch loop, plus replies to web
// authentication requests which are matched to their caller by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tradebot_app::client::{
    ClientError, EngineError, NegotiationEngine, SteamClient, WebAuthError, WebAuthenticator,
    WebSession,
};
use tradebot_core::backoff::ExponentialBackoff;
use tradebot_core::protocol::{
    ChatEntryType, InboundEvent, LogOnDetails, MachineAuthResponse, PersonaState, SteamId,
    TradeRequestId,
};

pub const WEB_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Requests sent to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    Connect,
    Disconnect,
    LogOn { details: LogOnDetails },
    MachineAuthResponse { response: MachineAuthResponse },
    SetPersonaState { state: PersonaState },
    SetPersonaName { name: String },
    AddFriend { steam_id: SteamId },
    SendChatMessage {
        to: SteamId,
        entry_type: ChatEntryType,
        message: String,
    },
    RequestTrade { with: SteamId },
    RespondToTrade { trade_id: TradeRequestId, accept: bool },
    WebAuthenticate {
        request_id: u64,
        login_key: String,
        unique_id: u32,
    },
    AttachWebSession { session_id: String, token: String },
    StartTrade { me: SteamId, other: SteamId },
    StopTrade,
}

/// Frames received from the bridge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum BridgeFrame {
    Event {
        event: InboundEvent,
    },
    WebAuthResult {
        request_id: u64,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Pending web-auth requests
// ---------------------------------------------------------------------------

type WebAuthReply = oneshot::Sender<Result<WebSession, WebAuthError>>;

/// Web-auth requests waiting for a `WebAuthResult` frame.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<u64, WebAuthReply>>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, WebAuthReply>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, request_id: u64, reply: WebAuthReply) {
        self.lock().insert(request_id, reply);
    }

    fn remove(&self, request_id: u64) {
        self.lock().remove(&request_id);
    }

    /// Deliver a result. Returns `false` if nobody is waiting for it.
    pub fn complete(&self, request_id: u64, result: Result<WebSession, WebAuthError>) -> bool {
        match self.lock().remove(&request_id) {
            Some(reply) => reply.send(result).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request, e.g. after the connection dropped.
    pub fn fail_all(&self) {
        for (_, reply) in self.lock().drain() {
            let _ = reply.send(Err(WebAuthError::Transport(
                "bridge connection lost".into(),
            )));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Client handle
// ---------------------------------------------------------------------------

/// Outbound side of the bridge, shared by the dispatch loop's collaborators.
pub struct BridgeClient {
    outbound: mpsc::Sender<BridgeCommand>,
    pending: PendingRequests,
    next_request: AtomicU64,
    web_session: Mutex<Option<WebSession>>,
    request_timeout: Duration,
}

impl BridgeClient {
    pub fn new(outbound: mpsc::Sender<BridgeCommand>, pending: PendingRequests) -> Self {
        Self {
            outbound,
            pending,
            next_request: AtomicU64::new(1),
            web_session: Mutex::new(None),
            request_timeout: WEB_AUTH_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn send(&self, operation: &'static str, command: BridgeCommand) -> Result<(), ClientError> {
        self.outbound.try_send(command).map_err(|e| match e {
            TrySendError::Closed(_) => ClientError::Closed,
            TrySendError::Full(_) => ClientError::Rejected {
                operation,
                message: "outbound queue is full".into(),
            },
        })
    }

    fn has_web_session(&self) -> bool {
        self.web_session
            .lock()
            .map(|session| session.is_some())
            .unwrap_or(false)
    }
}

impl SteamClient for BridgeClient {
    fn connect(&self) -> Result<(), ClientError> {
        self.send("connect", BridgeCommand::Connect)
    }

    fn disconnect(&self) -> Result<(), ClientError> {
        self.send("disconnect", BridgeCommand::Disconnect)
    }

    fn log_on(&self, details: &LogOnDetails) -> Result<(), ClientError> {
        self.send(
            "log_on",
            BridgeCommand::LogOn {
                details: details.clone(),
            },
        )
    }

    fn send_machine_auth_response(
        &self,
        response: &MachineAuthResponse,
    ) -> Result<(), ClientError> {
        self.send(
            "machine_auth_response",
            BridgeCommand::MachineAuthResponse {
                response: response.clone(),
            },
        )
    }

    fn set_persona_state(&self, state: PersonaState) -> Result<(), ClientError> {
        self.send("set_persona_state", BridgeCommand::SetPersonaState { state })
    }

    fn set_persona_name(&self, name: &str) -> Result<(), ClientError> {
        self.send(
            "set_persona_name",
            BridgeCommand::SetPersonaName {
                name: name.to_string(),
            },
        )
    }

    fn add_friend(&self, id: SteamId) -> Result<(), ClientError> {
        self.send("add_friend", BridgeCommand::AddFriend { steam_id: id })
    }

    fn send_chat_message(
        &self,
        to: SteamId,
        entry_type: ChatEntryType,
        message: &str,
    ) -> Result<(), ClientError> {
        self.send(
            "send_chat_message",
            BridgeCommand::SendChatMessage {
                to,
                entry_type,
                message: message.to_string(),
            },
        )
    }

    fn request_trade(&self, with: SteamId) -> Result<(), ClientError> {
        self.send("request_trade", BridgeCommand::RequestTrade { with })
    }

    fn respond_to_trade(&self, trade_id: TradeRequestId, accept: bool) -> Result<(), ClientError> {
        self.send(
            "respond_to_trade",
            BridgeCommand::RespondToTrade { trade_id, accept },
        )
    }
}

#[async_trait]
impl WebAuthenticator for BridgeClient {
    async fn authenticate(
        &self,
        login_key: &str,
        unique_id: u32,
    ) -> Result<WebSession, WebAuthError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(request_id, reply_tx);

        let command = BridgeCommand::WebAuthenticate {
            request_id,
            login_key: login_key.to_string(),
            unique_id,
        };
        if self.outbound.send(command).await.is_err() {
            self.pending.remove(request_id);
            return Err(WebAuthError::Transport("bridge is not running".into()));
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WebAuthError::Transport("bridge dropped the request".into())),
            Err(_) => {
                self.pending.remove(request_id);
                Err(WebAuthError::Timeout)
            }
        }
    }
}

impl NegotiationEngine for BridgeClient {
    fn attach_web_session(&self, session: WebSession) {
        let command = BridgeCommand::AttachWebSession {
            session_id: session.session_id.clone(),
            token: session.token.clone(),
        };
        if let Ok(mut current) = self.web_session.lock() {
            *current = Some(session);
        }
        if let Err(e) = self.send("attach_web_session", command) {
            warn!("Failed to hand web session to bridge: {}", e);
        }
    }

    fn start(&self, me: SteamId, other: SteamId) -> Result<(), EngineError> {
        if !self.has_web_session() {
            return Err(EngineError::NoWebSession);
        }
        self.send("start_trade", BridgeCommand::StartTrade { me, other })
            .map_err(|e| EngineError::Start(e.to_string()))
    }

    fn stop(&self) {
        if let Err(e) = self.send("stop_trade", BridgeCommand::StopTrade) {
            debug!("Failed to stop trade engine: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// Decode one text frame and route it. Returns `Err(())` once the event
/// forwarder has gone away.
///
/// Web-auth replies are completed here, on the reader, so a dispatch loop
/// blocked on `authenticate` is answered however many events are queued
/// ahead of the reply.
pub fn process_frame(
    text: &str,
    inbox: &mpsc::UnboundedSender<InboundEvent>,
    pending: &PendingRequests,
) -> Result<(), ()> {
    let frame: BridgeFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring malformed bridge frame: {}", e);
            return Ok(());
        }
    };

    match frame {
        BridgeFrame::Event { event } => inbox.send(event).map_err(|_| ()),
        BridgeFrame::WebAuthResult {
            request_id,
            session_id,
            token,
            error,
        } => {
            let result = match (session_id, token, error) {
                (_, _, Some(error)) => Err(WebAuthError::Rejected(error)),
                (Some(session_id), Some(token), None) => Ok(WebSession { session_id, token }),
                _ => Err(WebAuthError::Rejected("incomplete web session".into())),
            };
            if !pending.complete(request_id, result) {
                debug!("No caller waiting for web auth request {}", request_id);
            }
            Ok(())
        }
    }
}

/// Feed every text message from `stream` through [`process_frame`] until the
/// stream closes or errors.
pub async fn process_message_stream<St>(
    mut stream: St,
    inbox: &mpsc::UnboundedSender<InboundEvent>,
    pending: &PendingRequests,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => process_frame(text.as_str(), inbox, pending)?,
            Ok(Message::Close(_)) => {
                info!("Bridge sent close frame");
                break;
            }
            Err(e) => {
                warn!("Bridge connection error: {}", e);
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Move events from the reader's inbox to the dispatch loop, in order.
///
/// Backpressure from a busy dispatch loop stops here instead of stalling the
/// socket reader.
pub async fn forward_events(
    mut inbox: mpsc::UnboundedReceiver<InboundEvent>,
    events: mpsc::Sender<InboundEvent>,
) {
    while let Some(event) = inbox.recv().await {
        if events.send(event).await.is_err() {
            debug!("Dispatch loop gone, dropping bridge events");
            return;
        }
    }
}

/// Keep a connection to the bridge at `url` open until the outbound channel
/// or the dispatch loop goes away.
///
/// A dropped connection is reported to the dispatch loop as
/// `InboundEvent::Disconnected`; the dial is retried with backoff.
pub async fn run(
    url: String,
    mut outbound: mpsc::Receiver<BridgeCommand>,
    events: mpsc::Sender<InboundEvent>,
    pending: PendingRequests,
) -> anyhow::Result<()> {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
    let (inbox, inbox_rx) = mpsc::unbounded_channel();
    // Ends by itself once `inbox` is dropped and drained.
    tokio::spawn(forward_events(inbox_rx, events));

    loop {
        if inbox.is_closed() {
            return Ok(());
        }
        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("Could not reach bridge at {} ({}), retrying in {:?}", url, e, delay);
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        backoff.reset();
        info!("Connected to bridge at {}", url);

        let (mut write, read) = ws.split();
        let reader = process_message_stream(read, &inbox, &pending);
        tokio::pin!(reader);

        let dispatch_gone = loop {
            tokio::select! {
                result = &mut reader => break result.is_err(),
                command = outbound.recv() => {
                    let Some(command) = command else {
                        info!("Outbound channel closed, leaving bridge");
                        let _ = write.close().await;
                        pending.fail_all();
                        return Ok(());
                    };
                    let text = match serde_json::to_string(&command) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Could not encode bridge command: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!("Bridge write failed: {}", e);
                        break false;
                    }
                }
            }
        };

        pending.fail_all();
        if dispatch_gone {
            return Ok(());
        }
        warn!("Lost connection to bridge");
        if inbox.send(InboundEvent::Disconnected).is_err() {
            return Ok(());
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::Error as WsError;
    use tradebot_core::protocol::EResult;

    fn mock_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    fn client() -> (BridgeClient, mpsc::Receiver<BridgeCommand>, PendingRequests) {
        let (tx, rx) = mpsc::channel(8);
        let pending = PendingRequests::default();
        (BridgeClient::new(tx, pending.clone()), rx, pending)
    }

    #[tokio::test]
    async fn event_frames_are_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = PendingRequests::default();
        let frame = r#"{"frame":"event","event":{"type":"connected","result":"ok"}}"#;

        process_frame(frame, &tx, &pending).unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            InboundEvent::Connected { result: EResult::Ok }
        );
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = PendingRequests::default();

        process_frame("not json", &tx, &pending).unwrap();
        process_frame(r#"{"frame":"bogus"}"#, &tx, &pending).unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_event_channel_is_reported() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let pending = PendingRequests::default();
        let frame = r#"{"frame":"event","event":{"type":"disconnected"}}"#;

        assert!(process_frame(frame, &tx, &pending).is_err());
    }

    #[tokio::test]
    async fn stream_stops_at_close_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = PendingRequests::default();
        let messages = vec![
            Ok(Message::Text(
                r#"{"frame":"event","event":{"type":"disconnected"}}"#.into(),
            )),
            Ok(Message::Ping(vec![].into())),
            Ok(Message::Close(None)),
            Ok(Message::Text(
                r#"{"frame":"event","event":{"type":"disconnected"}}"#.into(),
            )),
        ];

        process_message_stream(mock_stream(messages), &tx, &pending)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), InboundEvent::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn web_auth_round_trip_through_pending_requests() {
        let (client, mut outbound, pending) = client();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let auth = tokio::spawn(async move { client.authenticate("key", 42).await });

        let request_id = match outbound.recv().await.unwrap() {
            BridgeCommand::WebAuthenticate {
                request_id,
                login_key,
                unique_id,
            } => {
                assert_eq!(login_key, "key");
                assert_eq!(unique_id, 42);
                request_id
            }
            other => panic!("Expected WebAuthenticate, got {:?}", other),
        };
        let reply = format!(
            r#"{{"frame":"web_auth_result","request_id":{request_id},"session_id":"sid","token":"tok"}}"#
        );
        process_frame(&reply, &events_tx, &pending).unwrap();

        let session = auth.await.unwrap().unwrap();
        assert_eq!(session.session_id, "sid");
        assert_eq!(session.token, "tok");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn web_auth_error_frame_is_a_rejection() {
        let (client, mut outbound, pending) = client();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let auth = tokio::spawn(async move { client.authenticate("key", 1).await });
        let Some(BridgeCommand::WebAuthenticate { request_id, .. }) = outbound.recv().await else {
            panic!("Expected WebAuthenticate");
        };
        let reply = format!(
            r#"{{"frame":"web_auth_result","request_id":{request_id},"error":"bad key"}}"#
        );
        process_frame(&reply, &events_tx, &pending).unwrap();

        let err = auth.await.unwrap().unwrap_err();
        assert!(matches!(err, WebAuthError::Rejected(msg) if msg == "bad key"));
    }

    #[tokio::test]
    async fn web_auth_reply_is_read_while_dispatch_is_busy() {
        let (client, mut outbound, pending) = client();
        // Dispatch is blocked on the web auth call and drains nothing.
        let (events_tx, mut events_rx) = mpsc::channel(1);
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_events(inbox_rx, events_tx));

        let auth = tokio::spawn(async move { client.authenticate("key", 7).await });
        let Some(BridgeCommand::WebAuthenticate { request_id, .. }) = outbound.recv().await else {
            panic!("Expected WebAuthenticate");
        };

        let friends = r#"{"frame":"event","event":{"type":"friends_list","friends":[]}}"#;
        let reply = format!(
            r#"{{"frame":"web_auth_result","request_id":{request_id},"session_id":"sid","token":"tok"}}"#
        );
        let messages = vec![
            Ok(Message::Text(friends.into())),
            Ok(Message::Text(friends.into())),
            Ok(Message::Text(reply.into())),
        ];
        process_message_stream(mock_stream(messages), &inbox, &pending)
            .await
            .unwrap();

        let session = auth.await.unwrap().unwrap();
        assert_eq!(session.session_id, "sid");

        // Both queued events still arrive, in order, once dispatch drains.
        drop(inbox);
        for _ in 0..2 {
            assert!(matches!(
                events_rx.recv().await.unwrap(),
                InboundEvent::FriendsList { .. }
            ));
        }
        forwarder.await.unwrap();
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn forwarder_stops_when_dispatch_is_gone() {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        drop(events_rx);

        let forwarder = tokio::spawn(forward_events(inbox_rx, events_tx));
        inbox.send(InboundEvent::Disconnected).unwrap();
        forwarder.await.unwrap();

        assert!(inbox.send(InboundEvent::Disconnected).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn web_auth_times_out_and_forgets_the_request() {
        let (client, _outbound, pending) = client();
        let client = client.with_request_timeout(Duration::from_secs(5));

        let err = client.authenticate("key", 1).await.unwrap_err();

        assert!(matches!(err, WebAuthError::Timeout));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn lost_connection_fails_outstanding_requests() {
        let (client, mut outbound, pending) = client();

        let auth = tokio::spawn(async move { client.authenticate("key", 1).await });
        outbound.recv().await.unwrap();
        pending.fail_all();

        let err = auth.await.unwrap().unwrap_err();
        assert!(matches!(err, WebAuthError::Transport(_)));
    }

    #[test]
    fn engine_refuses_to_start_without_web_session() {
        let (client, mut outbound, _pending) = client();

        assert!(matches!(
            client.start(SteamId(1), SteamId(2)),
            Err(EngineError::NoWebSession)
        ));

        client.attach_web_session(WebSession {
            session_id: "sid".into(),
            token: "tok".into(),
        });
        client.start(SteamId(1), SteamId(2)).unwrap();

        assert!(matches!(
            outbound.try_recv().unwrap(),
            BridgeCommand::AttachWebSession { .. }
        ));
        assert_eq!(
            outbound.try_recv().unwrap(),
            BridgeCommand::StartTrade {
                me: SteamId(1),
                other: SteamId(2),
            }
        );
    }

    #[test]
    fn full_outbound_queue_is_a_client_error() {
        let (tx, _rx) = mpsc::channel(1);
        let client = BridgeClient::new(tx, PendingRequests::default());

        client.connect().unwrap();
        let err = client.disconnect().unwrap_err();

        assert!(matches!(err, ClientError::Rejected { operation: "disconnect", .. }));
    }

    #[test]
    fn commands_serialize_with_type_tag() {
        let json = serde_json::to_string(&BridgeCommand::RespondToTrade {
            trade_id: TradeRequestId(5),
            accept: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"respond_to_trade","trade_id":5,"accept":true}"#);
    }
}
