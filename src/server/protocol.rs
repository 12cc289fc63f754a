//! Protocol message definitions
//!
//! Defines the envelope exchanged between chat clients and the relay.
//! Every frame is a UTF-8 JSON text message of the form
//! `{"type": "<tag>", "payload": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// WebSocket sub-protocol spoken by chat clients
pub const PROTOCOL_NAME: &str = "beej-chat-protocol";

/// Envelope type tags understood by the relay
pub const KNOWN_TYPES: [&str; 3] = ["chat-join", "chat-message", "chat-leave"];

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unknown envelope type: {kind}")]
    UnknownEnvelopeType {
        /// The unrecognized tag
        kind: String,
        /// `payload.username`, when the payload carries one as a string
        username: Option<String>,
    },

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Envelope
// ============================================================================

/// A single chat protocol message
///
/// Serialized adjacently tagged, so `Envelope::ChatJoin { username: "Alice" }`
/// becomes `{"type":"chat-join","payload":{"username":"Alice"}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Envelope {
    /// A user announced themselves
    ChatJoin {
        /// Display name of the joining user
        username: String,
    },

    /// A line of chat text
    ChatMessage {
        /// Display name of the sender
        username: String,
        /// Message body
        message: String,
    },

    /// A user disconnected (server to client only)
    ChatLeave {
        /// Last known display name of the departing user
        username: String,
    },
}

/// Loosely typed view of a frame, used to tell a bad shape from an unknown tag
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    payload: Map<String, Value>,
}

impl Envelope {
    /// Create a ChatJoin envelope
    pub fn join(username: impl Into<String>) -> Self {
        Envelope::ChatJoin {
            username: username.into(),
        }
    }

    /// Create a ChatMessage envelope
    pub fn message(username: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope::ChatMessage {
            username: username.into(),
            message: message.into(),
        }
    }

    /// Create a ChatLeave envelope
    pub fn leave(username: impl Into<String>) -> Self {
        Envelope::ChatLeave {
            username: username.into(),
        }
    }

    /// Wire tag of this envelope
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ChatJoin { .. } => "chat-join",
            Envelope::ChatMessage { .. } => "chat-message",
            Envelope::ChatLeave { .. } => "chat-leave",
        }
    }

    /// Username carried in the payload, untrimmed
    pub fn username(&self) -> &str {
        match self {
            Envelope::ChatJoin { username }
            | Envelope::ChatMessage { username, .. }
            | Envelope::ChatLeave { username } => username,
        }
    }

    /// Serialize the envelope to a text frame
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame into an envelope
    ///
    /// Frames that are not `{type, payload}` objects, or whose payload does not
    /// fit the declared type, are `MalformedEnvelope`. Well-formed frames with a
    /// tag outside [`KNOWN_TYPES`] are `UnknownEnvelopeType`.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        let raw: RawEnvelope = serde_json::from_str(frame)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;

        if !KNOWN_TYPES.contains(&raw.kind.as_str()) {
            let username = raw
                .payload
                .get("username")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Err(ProtocolError::UnknownEnvelopeType {
                kind: raw.kind,
                username,
            });
        }

        let mut tagged = Map::with_capacity(2);
        tagged.insert("type".to_string(), Value::String(raw.kind));
        tagged.insert("payload".to_string(), Value::Object(raw.payload));

        serde_json::from_value(Value::Object(tagged))
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }
}
