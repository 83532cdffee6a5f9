//! WebSocket Game Server
//!
//! Accepts WebSocket connections, authenticates them during the handshake,
//! and pumps JSON text frames between each socket and the orchestrator.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, accept_hdr_async};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use crate::network::orchestrator::{env_or, Orchestrator};
use crate::network::protocol::{ErrorCode, ServerError, ServerMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound message buffer per connection.
    pub outbound_buffer: usize,
    /// How long to wait for queued messages to flush on close.
    pub flush_timeout: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            outbound_buffer: 128,
            flush_timeout: Duration::from_secs(5),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_or("BIND_ADDR", d.bind_addr),
            max_connections: env_or("MAX_CONNECTIONS", d.max_connections),
            outbound_buffer: env_or("OUTBOUND_BUFFER", d.outbound_buffer).max(1),
            flush_timeout: d.flush_timeout,
            version: d.version,
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Pull a bearer token from the `Authorization` header or a `token` query parameter.
pub fn extract_token(req: &Request) -> Option<String> {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if header.is_some() {
        return header;
    }

    req.uri()
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|t| !t.is_empty())
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Match flow.
    orchestrator: Arc<Orchestrator>,
    /// Open sockets.
    active: Arc<AtomicUsize>,
    /// Shutdown request.
    shutdown_tx: broadcast::Sender<()>,
    /// Tells connection tasks to close.
    close_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (close_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            close_tx,
        }
    }

    /// Run the server until shutdown.
    #[instrument(skip(self), fields(addr = %self.config.bind_addr))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(version = %self.config.version, "Game server listening on {}", self.config.bind_addr);

        let sweeper_handle = tokio::spawn(self.orchestrator.clone().run_sweeper());
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                tokio::spawn(reject_overloaded(stream, addr));
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Disconnects after this point no longer forfeit.
        self.orchestrator.shutdown("Server shutting down").await;
        let _ = self.close_tx.send(());
        sweeper_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let orchestrator = self.orchestrator.clone();
        let config = self.config.clone();
        let active = self.active.clone();
        let mut close_rx = self.close_tx.subscribe();

        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut token = None;
            let handshake = accept_hdr_async(stream, |req: &Request, resp: Response| {
                token = extract_token(req);
                Ok::<_, ErrorResponse>(resp)
            })
            .await;

            let ws_stream = match handshake {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    active.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(config.outbound_buffer);

            let conn = match orchestrator.connect(token.as_deref().unwrap_or(""), msg_tx.clone()).await {
                Ok(id) => id,
                Err(e) => {
                    warn!("Rejected connection from {}: {}", addr, e);
                    let reply = ServerMessage::Error(ServerError::new(ErrorCode::AuthFailed, e.to_string()));
                    if let Ok(text) = reply.to_json() {
                        let _ = ws_sender.send(Message::Text(text)).await;
                    }
                    let _ = ws_sender.send(Message::Close(None)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };
            info!(connection = conn, "Client {} connected", addr);
            let evict = orchestrator.eviction_signal(conn).await.unwrap_or_default();

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.send(Message::Close(None)).await;
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                orchestrator.handle_text(conn, &text).await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = msg_tx.send(ServerMessage::Error(ServerError::new(
                                    ErrorCode::InvalidMessage,
                                    "binary frames are not supported",
                                ))).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = evict.notified() => {
                        warn!(connection = conn, "Client {} too slow, closing", addr);
                        break;
                    }
                    _ = close_rx.recv() => {
                        break;
                    }
                }
            }

            // Cleanup
            orchestrator.disconnect(conn).await;
            drop(msg_tx);
            if tokio::time::timeout(config.flush_timeout, sender_task).await.is_err() {
                debug!("Client {} did not drain in time", addr);
            }
            active.fetch_sub(1, Ordering::SeqCst);

            info!(connection = conn, "Client {} cleaned up", addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get open socket count.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Match flow handle.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}

/// Complete the handshake only to tell the client the server is full.
async fn reject_overloaded(stream: TcpStream, addr: SocketAddr) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Handshake with rejected client {} failed: {}", addr, e);
            return;
        }
    };
    let reply = ServerMessage::Error(ServerError::new(
        ErrorCode::ServerOverloaded,
        "server is at its connection limit",
    ));
    if let Ok(text) = reply.to_json() {
        let _ = ws.send(Message::Text(text)).await;
    }
    let _ = ws.close(None).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::auth::{AuthConfig, JwtIdentityProvider};
    use crate::network::ledger::MemoryLedger;
    use crate::network::orchestrator::OrchestratorConfig;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header("Authorization", value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[test]
    fn test_token_from_header() {
        let req = request("/ws", Some("Bearer abc.def.ghi"));
        assert_eq!(extract_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_token_from_query() {
        let req = request("/ws?room=1&token=abc.def.ghi", None);
        assert_eq!(extract_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_header_wins_over_query() {
        let req = request("/ws?token=from-query", Some("Bearer from-header"));
        assert_eq!(extract_token(&req).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_missing_token() {
        assert!(extract_token(&request("/ws", None)).is_none());
        assert!(extract_token(&request("/ws?token=", Some("Basic xyz"))).is_none());
    }

    #[tokio::test]
    async fn test_full_server_reports_overload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            reject_overloaded(stream, peer).await;
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        let text = ws.next().await.unwrap().unwrap().into_text().unwrap();
        match ServerMessage::from_json(&text).unwrap() {
            ServerMessage::Error(e) => assert_eq!(e.code, ErrorCode::ServerOverloaded),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let orchestrator = Orchestrator::in_memory(
            OrchestratorConfig::default(),
            Arc::new(JwtIdentityProvider::new(AuthConfig::default())),
            Arc::new(MemoryLedger::new()),
        );
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config, Arc::new(orchestrator));

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.orchestrator().match_count().await, 0);
        server.shutdown();
    }
}
