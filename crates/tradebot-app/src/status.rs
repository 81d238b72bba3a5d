// One-way status channel to the presentation layer.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use tradebot_core::protocol::{PersonaState, SteamId};

use crate::session::SessionState;

/// Updates pushed to whatever front end is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    /// Free-form status line (e.g. "Logging in...").
    Status { text: String, at: DateTime<Utc> },
    SessionState(SessionState),
    Persona { name: String, state: PersonaState },
    TradeOpened { peer: SteamId },
    TradeClosed { peer: SteamId },
}

/// Fire-and-forget sender for [`UiUpdate`]s.
///
/// Uses `try_send` so the bot never waits on the front end: a full or closed
/// channel simply drops the update.
#[derive(Debug, Clone, Default)]
pub struct StatusSink {
    tx: Option<mpsc::Sender<UiUpdate>>,
}

impl StatusSink {
    pub fn new(tx: mpsc::Sender<UiUpdate>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink with no front end attached.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, update: UiUpdate) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(update) {
            debug!("Dropping UI update: {}", e);
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        self.send(UiUpdate::Status {
            text: text.into(),
            at: Utc::now(),
        });
    }
}
