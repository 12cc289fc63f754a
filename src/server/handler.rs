//! Envelope dispatch and broadcast
//!
//! Applies per-type chat logic to inbound envelopes and fans the results out
//! to every registered connection.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::protocol::Envelope;
use crate::registry::{ConnectionKey, ConnectionRegistry};

/// Routes decoded envelopes from one connection to all connections
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over a registry
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Get the underlying registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle one envelope received from `sender`
    ///
    /// Any non-empty username in the payload first replaces the sender's
    /// stored name; there is no separate rename message. Returns the number
    /// of connections the resulting broadcast reached.
    pub async fn dispatch(&self, sender: &ConnectionKey, envelope: Envelope) -> usize {
        self.sync_username(sender, envelope.username()).await;

        debug!("Message from {}: {}", sender, envelope.kind());

        match envelope {
            Envelope::ChatJoin { username } => {
                self.broadcast(&Envelope::join(username.trim())).await
            }
            Envelope::ChatMessage { username, message } => {
                let text = message.trim();
                if text.is_empty() {
                    return 0;
                }
                self.broadcast(&Envelope::message(username.trim(), text))
                    .await
            }
            Envelope::ChatLeave { .. } => {
                warn!("Ignoring client-sent chat-leave from {}", sender);
                0
            }
        }
    }

    /// Store `username` for `sender` unless it is empty
    ///
    /// Also applied to frames whose type is not understood, so any payload
    /// carrying a username renames its sender.
    pub async fn sync_username(&self, sender: &ConnectionKey, username: &str) {
        if !username.is_empty() {
            self.registry.set_username(sender, username).await;
        }
    }

    /// Announce that a user has left
    pub async fn leave(&self, username: &str) -> usize {
        self.broadcast(&Envelope::leave(username)).await
    }

    /// Send an envelope to every registered connection, including the origin
    ///
    /// Connections whose task has already stopped are skipped. Returns the
    /// number of connections the frame was queued for.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {} envelope: {}", envelope.kind(), e);
                return 0;
            }
        };

        let mut delivered = 0;
        self.registry
            .for_each(|record| match record.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => debug!("Skipping closed connection {}", record.key()),
            })
            .await;
        delivered
    }
}
