//! WebSocket server module
//!
//! Admits chat clients, decodes their envelopes, and relays the results to
//! every connected peer.

mod gatekeeper;
mod handler;
mod protocol;
mod websocket;

pub use gatekeeper::*;
pub use handler::*;
pub use protocol::*;
pub use websocket::*;
