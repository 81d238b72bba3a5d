// Shared domain types for the trade bot: protocol events, device-trust
// (sentry) persistence, inventory snapshots, retry backoff and configuration.

pub mod backoff;
pub mod config;
pub mod inventory;
pub mod protocol;
pub mod sentry;
