//! Connection admission
//!
//! Decides, before the WebSocket handshake completes, whether a connection
//! attempt may proceed. Only browsers served from a known host and speaking
//! the chat sub-protocol are admitted.

use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderMap, StatusCode, Uri};

/// Why a connection attempt was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("Forbidden")]
    Forbidden,

    #[error("Unknown protocol")]
    UnknownProtocol,
}

impl RejectReason {
    /// HTTP status sent back on the upgrade request
    pub fn status(&self) -> StatusCode {
        match self {
            RejectReason::Forbidden => StatusCode::FORBIDDEN,
            RejectReason::UnknownProtocol => StatusCode::BAD_REQUEST,
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the handshake, selecting this sub-protocol
    Accept(String),
    /// Refuse the handshake
    Reject(RejectReason),
}

/// Origin allowlist and sub-protocol check
#[derive(Debug, Clone)]
pub struct Gatekeeper {
    allowed_origins: Vec<String>,
    protocol: String,
}

impl Gatekeeper {
    /// Create a gatekeeper from an allowlist of hosts (`host` or `host:port`)
    pub fn new(allowed_origins: Vec<String>, protocol: impl Into<String>) -> Self {
        Self {
            allowed_origins,
            protocol: protocol.into(),
        }
    }

    /// Check whether a host appears verbatim in the allowlist
    pub fn is_allowed(&self, host: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| allowed == host)
    }

    /// Decide on a connection attempt
    ///
    /// Only the first requested sub-protocol is compared; a client listing
    /// the chat protocol second is rejected.
    pub fn admit<S: AsRef<str>>(
        &self,
        origin: Option<&str>,
        requested_protocols: &[S],
    ) -> Admission {
        let host = origin.and_then(origin_host);
        if !host.is_some_and(|h| self.is_allowed(&h)) {
            return Admission::Reject(RejectReason::Forbidden);
        }

        match requested_protocols.first() {
            Some(first) if first.as_ref() == self.protocol => {
                Admission::Accept(self.protocol.clone())
            }
            _ => Admission::Reject(RejectReason::UnknownProtocol),
        }
    }

    /// Decide on a handshake request using its `Origin` and
    /// `Sec-WebSocket-Protocol` headers
    pub fn admit_request(&self, request: &Request) -> Admission {
        let headers = request.headers();
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        self.admit(origin, &requested_protocols(headers))
    }
}

/// Extract `host[:port]` from an Origin header value such as
/// `http://localhost:9000`
pub fn origin_host(origin: &str) -> Option<String> {
    let uri: Uri = origin.parse().ok()?;
    uri.scheme()?;
    uri.authority().map(|authority| authority.as_str().to_string())
}

/// Sub-protocols requested by the client, in order
pub fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|protocol| protocol.trim().to_string())
        .filter(|protocol| !protocol.is_empty())
        .collect()
}
