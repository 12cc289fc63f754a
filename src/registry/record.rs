//! Per-connection chat metadata
//!
//! A record pairs a connection's identity key with the username it last
//! announced and the sender used to push text frames to it.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;

/// Outbound half of a connection: text frames queued here are written to the
/// socket by the connection's own task
pub type ConnectionSender = mpsc::UnboundedSender<String>;

/// Stable identity of a live connection, derived from the remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    /// Create a key from an arbitrary endpoint string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for ConnectionKey {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutable chat state for one registered connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    key: ConnectionKey,
    /// Empty until the first join or message carrying a username
    username: String,
    sender: ConnectionSender,
}

impl ConnectionRecord {
    /// Create a record with no username yet
    pub fn new(key: ConnectionKey, sender: ConnectionSender) -> Self {
        Self {
            key,
            username: String::new(),
            sender,
        }
    }

    /// Get the identity key
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Get the last known username
    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn set_username(&mut self, username: String) {
        self.username = username;
    }

    /// Whether the connection's task has stopped draining its queue
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether this record still delivers to `sender`'s queue
    pub fn is_sender(&self, sender: &ConnectionSender) -> bool {
        self.sender.same_channel(sender)
    }

    /// Queue a text frame for delivery
    ///
    /// Fails only when the receiving task has already gone away.
    pub fn send(&self, frame: String) -> Result<(), mpsc::error::SendError<String>> {
        self.sender.send(frame)
    }
}
