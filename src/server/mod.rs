//! WebSocket server module
//!
//! Accepts room connections, authenticates them during the upgrade and relays
//! text between the members of each room.

mod handler;
mod protocol;
mod websocket;

#[allow(unused_imports)]
pub use handler::*;
#[allow(unused_imports)]
pub use protocol::*;
pub use websocket::*;
