// Adapters that connect the trade bot to the outside world: the protocol
// bridge, the Steam Web API and the operator console.

pub mod bridge;
pub mod console;
pub mod handlers;
pub mod web_api;
