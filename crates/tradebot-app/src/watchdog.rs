// Trade duration and peer inactivity limits.

use std::time::Duration;

use tokio::time::Instant;

use tradebot_core::config::TradeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// The trade has been open longer than the maximum trade time.
    TradeTooLong,
    /// The peer has not acted within the maximum action gap.
    PeerIdle,
}

/// Tracks the open trade's start time and the peer's last action.
///
/// Polled from the dispatch loop's tick; the trade-time limit fires once per
/// trade, the idle limit fires again after every further gap.
#[derive(Debug, Clone)]
pub struct TradeWatchdog {
    max_trade_time: Duration,
    max_action_gap: Duration,
    started_at: Option<Instant>,
    last_action: Option<Instant>,
    trade_limit_reported: bool,
}

impl TradeWatchdog {
    pub fn new(max_trade_time: Duration, max_action_gap: Duration) -> Self {
        Self {
            max_trade_time,
            max_action_gap,
            started_at: None,
            last_action: None,
            trade_limit_reported: false,
        }
    }

    pub fn from_config(config: &TradeConfig) -> Self {
        Self::new(config.maximum_trade_time, config.maximum_action_gap)
    }

    pub fn arm(&mut self, now: Instant) {
        self.started_at = Some(now);
        self.last_action = Some(now);
        self.trade_limit_reported = false;
    }

    /// Record a peer action.
    pub fn touch(&mut self, now: Instant) {
        if self.started_at.is_some() {
            self.last_action = Some(now);
        }
    }

    pub fn disarm(&mut self) {
        self.started_at = None;
        self.last_action = None;
        self.trade_limit_reported = false;
    }

    pub fn is_armed(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn check(&mut self, now: Instant) -> Option<TimeoutReason> {
        let started = self.started_at?;

        if !self.trade_limit_reported
            && now.saturating_duration_since(started) >= self.max_trade_time
        {
            self.trade_limit_reported = true;
            self.last_action = Some(now);
            return Some(TimeoutReason::TradeTooLong);
        }

        let last = self.last_action.unwrap_or(started);
        if now.saturating_duration_since(last) >= self.max_action_gap {
            self.last_action = Some(now);
            return Some(TimeoutReason::PeerIdle);
        }

        None
    }
}
