//! Beej Chat Relay library
//!
//! Connection registry, message codec, gatekeeper and WebSocket server used
//! by the `beej-chat` binary.

pub mod config;
pub mod registry;
pub mod server;
