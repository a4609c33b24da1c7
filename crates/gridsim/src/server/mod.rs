//! Control-Plane Server
//!
//! WebSocket endpoint carrying the JSON control channel between an engine
//! (or any UI) and the protocol relay.

mod handler;
mod protocol;
mod router;
mod state;

pub use handler::*;
pub use protocol::*;
pub use router::*;
pub use state::*;
