//! WebSocket server implementation
//!
//! Listens for chat clients, admits them through the gatekeeper, and runs one
//! task per connection that registers it, relays its frames, and announces
//! its departure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::gatekeeper::{Admission, Gatekeeper};
use super::handler::Dispatcher;
use super::protocol::{Envelope, ProtocolError};
use crate::config::ServerConfig;
use crate::registry::{ConnectionKey, ConnectionRegistry, ConnectionSender};

/// How long shutdown waits for connection tasks before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WebSocket server for chat clients
pub struct WebSocketServer {
    config: ServerConfig,
    gatekeeper: Arc<Gatekeeper>,
    dispatcher: Dispatcher,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server with an empty registry
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let gatekeeper = Gatekeeper::new(config.allowed_origins.clone(), config.protocol.clone());
        Self {
            config,
            gatekeeper: Arc::new(gatekeeper),
            dispatcher: Dispatcher::new(Arc::new(ConnectionRegistry::new())),
            shutdown_tx,
        }
    }

    /// Get the connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.dispatcher.registry()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run the server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}/", addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener until shutdown
    ///
    /// Returns once every connection task has sent its Close frame and
    /// announced its departure, or after a five second grace period.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let gatekeeper = Arc::clone(&self.gatekeeper);
                            let dispatcher = self.dispatcher.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            connections.spawn(async move {
                                let result = handle_connection(
                                    stream,
                                    peer_addr,
                                    gatekeeper,
                                    dispatcher,
                                    shutdown_rx,
                                )
                                .await;
                                if let Err(e) = result {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        if !connections.is_empty() {
            info!("Waiting for {} connections to close...", connections.len());
            let drained = timeout(SHUTDOWN_GRACE, async {
                while connections.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!("{} connections did not close in time, aborting", connections.len());
                connections.shutdown().await;
            }
        }

        if !self.registry().is_empty().await {
            warn!("{} connections still registered after shutdown", self.registry().len().await);
        }

        Ok(())
    }
}

/// Build the HTTP response sent when a handshake is refused
fn reject_response(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

/// Handle a single TCP connection from handshake to departure
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    gatekeeper: Arc<Gatekeeper>,
    dispatcher: Dispatcher,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let callback = |request: &Request, mut response: Response| {
        admission_callback(&gatekeeper, peer_addr, request, &mut response)?;
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        // Refused by the gatekeeper, already logged
        Err(tungstenite::Error::Http(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let key = ConnectionKey::from(peer_addr);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    on_admitted(&dispatcher, &key, &tx).await;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            // Frames from the client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        on_message(&dispatcher, &key, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Ignoring binary message from {} ({} bytes)", key, data.len());
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                        // Pongs are queued by tungstenite itself
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Client {} requested close: {:?}", key, frame);
                        break;
                    }
                    Some(Err(e)) => {
                        // The stream ends on its own after a fatal error
                        error!("WebSocket error from {}: {}", key, e);
                    }
                    None => {
                        break;
                    }
                }
            }
            // Frames broadcast to this client
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                            error!("Failed to send to {}: {}", key, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received, closing connection to {}", key);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    on_close(&dispatcher, &key, &tx).await;
    Ok(())
}

/// Run the gatekeeper on a handshake request
///
/// On acceptance the chosen sub-protocol is echoed in `response`.
fn admission_callback(
    gatekeeper: &Gatekeeper,
    peer_addr: SocketAddr,
    request: &Request,
    response: &mut Response,
) -> Result<(), ErrorResponse> {
    match gatekeeper.admit_request(request) {
        Admission::Accept(protocol) => {
            let value = HeaderValue::from_str(&protocol).map_err(|e| {
                reject_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            })?;
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            info!("Accepted connection from {}", peer_addr);
            Ok(())
        }
        Admission::Reject(reason) => {
            let origin = request
                .headers()
                .get(header::ORIGIN)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("<none>");
            warn!("Denying connection from {} (origin {}): {}", peer_addr, origin, reason);
            Err(reject_response(reason.status(), reason.to_string()))
        }
    }
}

/// Register an admitted connection, overwriting a stale entry if one exists
async fn on_admitted(dispatcher: &Dispatcher, key: &ConnectionKey, tx: &ConnectionSender) {
    let registry = dispatcher.registry();
    if let Err(e) = registry.register(key.clone(), tx.clone()).await {
        warn!("{}, replacing stale entry", e);
        registry.replace(key.clone(), tx.clone()).await;
    }
}

/// Decode one text frame and hand it to the dispatcher
async fn on_message(dispatcher: &Dispatcher, key: &ConnectionKey, text: &str) {
    match Envelope::decode(text) {
        Ok(envelope) => {
            dispatcher.dispatch(key, envelope).await;
        }
        Err(ProtocolError::UnknownEnvelopeType { kind, username }) => {
            if let Some(username) = username {
                dispatcher.sync_username(key, &username).await;
            }
            warn!("Unknown payload type from {}: {}", key, kind);
        }
        Err(e) => {
            warn!("Dropping frame from {}: {}", key, e);
        }
    }
}

/// Unregister a finished connection and tell everyone else it left
///
/// If the entry under `key` was replaced by another connection, it is left
/// alone and nothing is announced.
async fn on_close(dispatcher: &Dispatcher, key: &ConnectionKey, tx: &ConnectionSender) {
    let registry = dispatcher.registry();
    let Some(record) = registry.unregister_sender(key, tx).await else {
        debug!("Entry for {} belongs to a newer connection, not announcing", key);
        return;
    };

    let username = record.username();
    info!("Connection from {} closed ({:?})", key, username);

    dispatcher.leave(username).await;
    debug!("Online: {:?}", registry.usernames().await);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const ORIGIN: &str = "http://localhost:9000";

    async fn start_server() -> (Arc<WebSocketServer>, SocketAddr) {
        let server = Arc::new(WebSocketServer::new(ServerConfig::new("127.0.0.1", 0)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = Arc::clone(&server);
        tokio::spawn(async move { handle.serve(listener).await });
        (server, addr)
    }

    async fn connect_with(
        addr: SocketAddr,
        origin: &str,
        protocol: &str,
    ) -> Result<Client, tungstenite::Error> {
        let mut request = format!("ws://{}/", addr).into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(protocol).unwrap(),
        );
        let (client, _response) = connect_async(request).await?;
        Ok(client)
    }

    async fn connect(addr: SocketAddr) -> Client {
        connect_with(addr, ORIGIN, "beej-chat-protocol").await.unwrap()
    }

    async fn send(client: &mut Client, envelope: Envelope) {
        send_raw(client, &envelope.encode().unwrap()).await;
    }

    async fn send_raw(client: &mut Client, text: &str) {
        client.send(Message::Text(text.to_string())).await.unwrap();
    }

    async fn recv(client: &mut Client) -> Envelope {
        loop {
            let msg = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return Envelope::decode(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_chat_scenario() {
        let (server, addr) = start_server().await;

        let mut alice = connect(addr).await;
        send(&mut alice, Envelope::join("Alice")).await;
        assert_eq!(recv(&mut alice).await, Envelope::join("Alice"));

        let mut bob = connect(addr).await;
        send(&mut bob, Envelope::join("  Bob  ")).await;
        assert_eq!(recv(&mut alice).await, Envelope::join("Bob"));
        assert_eq!(recv(&mut bob).await, Envelope::join("Bob"));

        send(&mut alice, Envelope::message("Alice", "hi")).await;
        assert_eq!(recv(&mut alice).await, Envelope::message("Alice", "hi"));
        assert_eq!(recv(&mut bob).await, Envelope::message("Alice", "hi"));

        bob.close(None).await.unwrap();
        assert_eq!(recv(&mut alice).await, Envelope::leave("Bob"));
        assert_eq!(server.registry().len().await, 1);
        assert_eq!(server.registry().usernames().await, vec!["Alice"]);
    }

    #[tokio::test]
    async fn test_blank_message_not_relayed() {
        let (_server, addr) = start_server().await;
        let mut alice = connect(addr).await;

        send(&mut alice, Envelope::message("Alice", "   ")).await;
        send(&mut alice, Envelope::message("Alice", "after")).await;
        assert_eq!(recv(&mut alice).await, Envelope::message("Alice", "after"));
    }

    #[tokio::test]
    async fn test_bad_frames_keep_connection_open() {
        let (_server, addr) = start_server().await;
        let mut alice = connect(addr).await;

        send_raw(&mut alice, "not json").await;
        send_raw(&mut alice, r#"{"type":"chat-dance","payload":{"username":"x"}}"#).await;
        send_raw(&mut alice, r#"{"type":"chat-message","payload":{"username":"x"}}"#).await;
        send(&mut alice, Envelope::join("Alice")).await;
        assert_eq!(recv(&mut alice).await, Envelope::join("Alice"));
    }

    #[tokio::test]
    async fn test_leave_without_join_has_empty_username() {
        let (_server, addr) = start_server().await;
        let mut alice = connect(addr).await;
        send(&mut alice, Envelope::join("Alice")).await;
        assert_eq!(recv(&mut alice).await, Envelope::join("Alice"));

        let mut lurker = connect(addr).await;
        lurker.close(None).await.unwrap();
        assert_eq!(recv(&mut alice).await, Envelope::leave(""));
    }

    #[tokio::test]
    async fn test_leave_uses_latest_username() {
        let (_server, addr) = start_server().await;
        let mut alice = connect(addr).await;
        send(&mut alice, Envelope::join("Alice")).await;
        assert_eq!(recv(&mut alice).await, Envelope::join("Alice"));

        let mut bob = connect(addr).await;
        send(&mut bob, Envelope::join("Bob")).await;
        assert_eq!(recv(&mut alice).await, Envelope::join("Bob"));
        send(&mut bob, Envelope::message("Robert", "new name")).await;
        assert_eq!(recv(&mut alice).await, Envelope::message("Robert", "new name"));

        bob.close(None).await.unwrap();
        assert_eq!(recv(&mut alice).await, Envelope::leave("Robert"));
    }

    #[tokio::test]
    async fn test_unknown_type_renames_before_leave() {
        let (_server, addr) = start_server().await;
        let mut alice = connect(addr).await;
        send(&mut alice, Envelope::join("Alice")).await;
        assert_eq!(recv(&mut alice).await, Envelope::join("Alice"));

        let mut bob = connect(addr).await;
        send_raw(&mut bob, r#"{"type":"chat-rename","payload":{"username":"Zed"}}"#).await;
        bob.close(None).await.unwrap();
        assert_eq!(recv(&mut alice).await, Envelope::leave("Zed"));
    }

    #[tokio::test]
    async fn test_stale_close_keeps_replacement() {
        let dispatcher = Dispatcher::new(Arc::new(ConnectionRegistry::new()));
        let registry = Arc::clone(dispatcher.registry());

        let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
        registry
            .register(ConnectionKey::new("127.0.0.1:7000"), observer_tx)
            .await
            .unwrap();

        let key = ConnectionKey::new("127.0.0.1:7001");
        let (stale_tx, _stale_rx) = mpsc::unbounded_channel();
        let (fresh_tx, _fresh_rx) = mpsc::unbounded_channel();
        on_admitted(&dispatcher, &key, &stale_tx).await;
        on_admitted(&dispatcher, &key, &fresh_tx).await;
        registry.set_username(&key, "Newcomer").await;

        on_close(&dispatcher, &key, &stale_tx).await;
        let record = registry.lookup(&key).await.unwrap();
        assert_eq!(record.username(), "Newcomer");
        assert!(observer_rx.try_recv().is_err());

        on_close(&dispatcher, &key, &fresh_tx).await;
        assert!(registry.lookup(&key).await.is_err());
        let frame = observer_rx.try_recv().unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap(), Envelope::leave("Newcomer"));
    }

    #[tokio::test]
    async fn test_reject_unknown_origin() {
        let (server, addr) = start_server().await;

        let result = connect_with(addr, "http://evil.example", "beej-chat-protocol").await;
        match result {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::FORBIDDEN);
            }
            other => panic!("Expected 403 rejection, got {:?}", other.map(|_| ())),
        }
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_reject_unknown_protocol() {
        let (server, addr) = start_server().await;

        let result = connect_with(addr, ORIGIN, "other-protocol").await;
        match result {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            }
            other => panic!("Expected 400 rejection, got {:?}", other.map(|_| ())),
        }
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (server, addr) = start_server().await;
        let mut alice = connect(addr).await;
        send(&mut alice, Envelope::join("Alice")).await;
        assert_eq!(recv(&mut alice).await, Envelope::join("Alice"));

        server.shutdown();

        let closed = timeout(Duration::from_secs(5), async {
            loop {
                match alice.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_serve_waits_for_connections() {
        let server = Arc::new(WebSocketServer::new(ServerConfig::new("127.0.0.1", 0)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = Arc::clone(&server);
        let serving = tokio::spawn(async move { handle.serve(listener).await });

        let mut alice = connect(addr).await;
        send(&mut alice, Envelope::join("Alice")).await;
        assert_eq!(recv(&mut alice).await, Envelope::join("Alice"));
        let mut bob = connect(addr).await;
        send(&mut bob, Envelope::join("Bob")).await;
        assert_eq!(recv(&mut bob).await, Envelope::join("Bob"));
        assert_eq!(server.registry().len().await, 2);

        server.shutdown();

        let result = timeout(Duration::from_secs(10), serving)
            .await
            .expect("serve did not return")
            .unwrap();
        assert!(result.is_ok());
        assert!(server.registry().is_empty().await);
    }
}
