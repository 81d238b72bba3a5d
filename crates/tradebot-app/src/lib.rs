// Session lifecycle and trade orchestration for the trade bot.
//
// `dispatch::run` owns a `BotState` and drives every component from a single
// task: the session manager (connect, logon, device trust), the trade
// orchestrator (one trade at a time, listener wiring, timeouts) and the
// friends list. Collaborators are reached through the traits in `client`.

pub mod auth;
pub mod client;
pub mod dispatch;
pub mod friends;
pub mod handler;
pub mod session;
pub mod status;
pub mod trade;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod test_support;
