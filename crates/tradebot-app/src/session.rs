// Connection and logon lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tradebot_core::backoff::ExponentialBackoff;
use tradebot_core::inventory::ItemSchema;
use tradebot_core::protocol::{EResult, JobId, MachineAuthPayload, PersonaState, SteamId};

use crate::auth::{Authenticator, GuardReason};
use crate::client::{Services, WebSession};
use crate::status::UiUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    AwaitingVerificationCode,
    Authenticated,
    LoggedOn,
}

/// Connect/logon/web-handshake state machine for the bot account.
pub struct SessionManager {
    state: SessionState,
    auth: Authenticator,
    persona_name: String,
    own_id: Option<SteamId>,
    web_session: Option<WebSession>,
    schema: Option<Arc<ItemSchema>>,
    connect_backoff: ExponentialBackoff,
    web_auth_backoff: ExponentialBackoff,
}

impl SessionManager {
    pub fn new(auth: Authenticator, persona_name: impl Into<String>) -> Self {
        Self {
            state: SessionState::Disconnected,
            auth,
            persona_name: persona_name.into(),
            own_id: None,
            web_session: None,
            schema: None,
            connect_backoff: ExponentialBackoff::new(
                Duration::from_secs(1),
                Duration::from_secs(30),
            ),
            web_auth_backoff: ExponentialBackoff::new(
                Duration::from_secs(2),
                Duration::from_secs(60),
            ),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_logged_on(&self) -> bool {
        self.state == SessionState::LoggedOn
    }

    /// Our own account id, known from the first successful logon result.
    pub fn own_id(&self) -> Option<SteamId> {
        self.own_id
    }

    pub fn web_session(&self) -> Option<&WebSession> {
        self.web_session.as_ref()
    }

    pub fn schema(&self) -> Option<Arc<ItemSchema>> {
        self.schema.clone()
    }

    fn transition(&mut self, next: SessionState, text: &str, services: &Services) {
        if self.state != next {
            debug!("Session state: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        services.status.send(UiUpdate::SessionState(next));
        services.status.status(text);
    }

    /// Ask the protocol client to open a connection.
    pub fn connect(&mut self, services: &Services) {
        self.transition(SessionState::Connecting, "Connecting...", services);
        if let Err(e) = services.client.connect() {
            warn!("Connect request failed: {}", e);
        }
    }

    pub async fn on_connected(&mut self, result: EResult, services: &Services) {
        if result != EResult::Ok {
            let delay = self.connect_backoff.next_delay();
            warn!("Connection failed ({}), retrying in {:?}", result, delay);
            services.status.status("Connection failed! Retrying...");
            tokio::time::sleep(delay).await;
            self.connect(services);
            return;
        }

        self.connect_backoff.reset();
        info!("Connected, logging in");
        self.transition(SessionState::Authenticating, "Logging in...", services);
        self.submit_logon(services);
    }

    fn submit_logon(&mut self, services: &Services) {
        if let Err(e) = self.auth.log_on(services.client.as_ref()) {
            warn!("Logon request failed: {}", e);
        }
    }

    pub async fn on_logged_on(
        &mut self,
        result: EResult,
        steam_id: Option<SteamId>,
        services: &Services,
    ) {
        match result {
            EResult::Ok => {
                if steam_id.is_some() {
                    self.own_id = steam_id;
                }
                info!("Logon accepted, waiting for login key");
                services.status.status("Authenticating...");
            }
            EResult::AccountLogonDenied => {
                self.obtain_guard_code(GuardReason::CodeRequired, services)
                    .await
            }
            EResult::InvalidLoginAuthCode => {
                self.obtain_guard_code(GuardReason::InvalidCode, services)
                    .await
            }
            other => {
                warn!("Logon failed: {}", other);
                services.status.status(format!("Error: {other}"));
            }
        }
    }

    async fn obtain_guard_code(&mut self, reason: GuardReason, services: &Services) {
        let text = match reason {
            GuardReason::CodeRequired => "Steam Guard code required",
            GuardReason::InvalidCode => "Invalid Steam Guard code",
        };
        self.transition(SessionState::AwaitingVerificationCode, text, services);

        match self.auth.request_code(reason).await {
            Some(code) => {
                self.auth.set_auth_code(code);
                self.transition(SessionState::Authenticating, "Logging in...", services);
                self.submit_logon(services);
            }
            None => {
                warn!("Operator input closed, no Steam Guard code available");
                services.status.status("Waiting for Steam Guard code");
            }
        }
    }

    /// Login key received: complete the web handshake and finish logon.
    ///
    /// The handshake is retried with backoff until it succeeds.
    pub async fn on_login_key(&mut self, login_key: &str, unique_id: u32, services: &Services) {
        if self.state == SessionState::LoggedOn {
            debug!("Login key received while already logged on, refreshing web session");
        }

        let session = loop {
            match services.web_auth.authenticate(login_key, unique_id).await {
                Ok(session) => break session,
                Err(e) => {
                    let delay = self.web_auth_backoff.next_delay();
                    warn!("Web authentication failed ({}), retrying in {:?}", e, delay);
                    services.status.status("Authentication failed! Retrying...");
                    tokio::time::sleep(delay).await;
                }
            }
        };
        self.web_auth_backoff.reset();

        services.engine.attach_web_session(session.clone());
        self.web_session = Some(session);
        self.transition(SessionState::Authenticated, "Authenticated", services);

        self.ensure_schema(services).await;

        if let Err(e) = services.client.set_persona_state(PersonaState::Online) {
            warn!("Failed to set persona state: {}", e);
        }
        if let Err(e) = services.client.set_persona_name(&self.persona_name) {
            warn!("Failed to set persona name: {}", e);
        }
        services.status.send(UiUpdate::Persona {
            name: self.persona_name.clone(),
            state: PersonaState::Online,
        });

        self.transition(SessionState::LoggedOn, "Logged in", services);
        info!("Bot logged in completely as {}", self.persona_name);
    }

    /// Download the item schema once per process. Failures are retried on the
    /// next logon.
    async fn ensure_schema(&mut self, services: &Services) {
        if self.schema.is_some() {
            return;
        }
        info!("Downloading item schema");
        match services.schema.fetch_schema().await {
            Ok(schema) => {
                info!("Item schema downloaded ({} items)", schema.len());
                self.schema = Some(Arc::new(schema));
            }
            Err(e) => warn!("Item schema download failed: {}", e),
        }
    }

    pub fn on_machine_auth(&mut self, job_id: JobId, payload: &MachineAuthPayload, services: &Services) {
        match self
            .auth
            .handle_machine_auth(job_id, payload, services.client.as_ref())
        {
            Ok(hash) => info!("Saved sentry file ({})", hash),
            Err(e) => warn!("Could not persist sentry: {}", e),
        }
    }

    pub fn on_logged_off(&mut self, result: EResult, services: &Services) {
        info!("Logged off: {}", result);
        self.web_session = None;
        self.transition(
            SessionState::Disconnected,
            &format!("Logged off: {result}"),
            services,
        );
    }

    /// Connection lost. The caller is responsible for closing any trade and
    /// calling [`SessionManager::connect`] again.
    pub fn on_disconnected(&mut self, services: &Services) {
        warn!("Disconnected from Steam");
        self.web_session = None;
        self.transition(SessionState::Disconnected, "Disconnected", services);
    }

    /// Drop the connection for good.
    pub fn shutdown(&mut self, services: &Services) {
        if let Err(e) = services.client.disconnect() {
            debug!("Disconnect on shutdown failed: {}", e);
        }
        self.web_session = None;
        self.transition(SessionState::Disconnected, "Stopped", services);
    }
}
