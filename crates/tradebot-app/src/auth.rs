// Logon credentials, guard codes and device-trust (sentry) handling.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use tradebot_core::protocol::{
    EResult, JobId, LogOnDetails, MachineAuthPayload, MachineAuthResponse,
};
use tradebot_core::sentry::{SentryError, SentryHash, SentryStore};

use crate::client::{ClientError, SteamClient};

/// Why a verification code is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardReason {
    /// The account requires a code for this device.
    CodeRequired,
    /// The previously submitted code was rejected.
    InvalidCode,
}

impl GuardReason {
    pub fn prompt(&self) -> &'static str {
        match self {
            GuardReason::CodeRequired => {
                "This account is protected by Steam Guard. Enter the authentication code sent to the account's email:"
            }
            GuardReason::InvalidCode => {
                "An invalid Steam Guard code was entered. Enter the code sent to the account's email:"
            }
        }
    }
}

/// Handed to the guard callback; the callback fills in `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardCodeRequest {
    pub reason: GuardReason,
    pub code: String,
}

pub type GuardCodeCallback = Box<dyn FnMut(&mut GuardCodeRequest) + Send>;

/// Line-oriented operator input (the console in production).
#[async_trait]
pub trait OperatorInput: Send {
    /// Next line typed by the operator, or `None` once input is closed.
    async fn read_line(&mut self) -> Option<String>;
}

#[async_trait]
impl OperatorInput for mpsc::Receiver<String> {
    async fn read_line(&mut self) -> Option<String> {
        self.recv().await
    }
}

/// Owns the logon details and the device-trust store for one account.
pub struct Authenticator {
    details: LogOnDetails,
    sentry: Arc<dyn SentryStore>,
    guard_callback: Option<GuardCodeCallback>,
    operator: Box<dyn OperatorInput>,
    shutdown: Option<watch::Receiver<bool>>,
    attempts: u32,
}

impl Authenticator {
    pub fn new(
        details: LogOnDetails,
        sentry: Arc<dyn SentryStore>,
        operator: Box<dyn OperatorInput>,
    ) -> Self {
        Self {
            details,
            sentry,
            guard_callback: None,
            operator,
            shutdown: None,
            attempts: 0,
        }
    }

    /// Ask `callback` for guard codes before falling back to operator input.
    pub fn with_guard_callback(
        mut self,
        callback: impl FnMut(&mut GuardCodeRequest) + Send + 'static,
    ) -> Self {
        self.guard_callback = Some(Box::new(callback));
        self
    }

    /// Stop waiting for a code once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Logon submissions so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Submit credentials.
    ///
    /// The sentry hash is re-read from the store on every attempt so a payload
    /// persisted mid-session is used by the very next logon.
    pub fn log_on(&mut self, client: &dyn SteamClient) -> Result<(), ClientError> {
        self.details.sentry_hash = self.sentry.load(&self.details.username);
        self.attempts += 1;
        info!(
            "Logging on as {} (attempt {}, sentry: {})",
            self.details.username,
            self.attempts,
            if self.details.sentry_hash.is_some() {
                "present"
            } else {
                "absent"
            }
        );
        client.log_on(&self.details)
    }

    /// Obtain a verification code, first from the callback, then from the
    /// operator. Blank lines are skipped. `None` means input is exhausted or
    /// shutdown was requested.
    pub async fn request_code(&mut self, reason: GuardReason) -> Option<String> {
        let mut request = GuardCodeRequest {
            reason,
            code: String::new(),
        };
        if let Some(callback) = self.guard_callback.as_mut() {
            callback(&mut request);
        }
        let code = request.code.trim();
        if !code.is_empty() {
            return Some(code.to_string());
        }

        info!("{}", reason.prompt());
        loop {
            let line = match self.shutdown.as_mut() {
                Some(shutdown) => tokio::select! {
                    line = self.operator.read_line() => line,
                    stopped = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
                        if stopped {
                            info!("Shutdown requested, no longer waiting for a code");
                            return None;
                        }
                        // Nobody can request shutdown any more.
                        self.shutdown = None;
                        continue;
                    }
                },
                None => self.operator.read_line().await,
            }?;
            let code = line.trim();
            if !code.is_empty() {
                return Some(code.to_string());
            }
        }
    }

    /// Use `code` on the next logon attempt.
    pub fn set_auth_code(&mut self, code: String) {
        self.details.auth_code = Some(code);
    }

    /// Persist a machine-auth payload and acknowledge it.
    ///
    /// The acknowledgement is sent even when the write fails, carrying
    /// `EResult::Fail`, so the server does not keep the job open.
    pub fn handle_machine_auth(
        &self,
        job_id: JobId,
        payload: &MachineAuthPayload,
        client: &dyn SteamClient,
    ) -> Result<SentryHash, SentryError> {
        let saved = self.sentry.save(&self.details.username, &payload.data);
        let size = payload.bytes_to_write;
        let response = match &saved {
            Ok(hash) => MachineAuthResponse {
                job_id,
                file_name: payload.file_name.clone(),
                bytes_written: payload.bytes_to_write,
                file_size: size,
                offset: payload.offset,
                sentry_hash: *hash,
                one_time_password: payload.one_time_password.clone(),
                last_error: 0,
                result: EResult::Ok,
            },
            Err(_) => MachineAuthResponse {
                job_id,
                file_name: payload.file_name.clone(),
                bytes_written: 0,
                file_size: size,
                offset: payload.offset,
                sentry_hash: SentryHash::of(&payload.data),
                one_time_password: payload.one_time_password.clone(),
                last_error: 1,
                result: EResult::Fail,
            },
        };
        if let Err(e) = client.send_machine_auth_response(&response) {
            warn!("Failed to acknowledge machine auth: {}", e);
        }
        saved
    }
}
