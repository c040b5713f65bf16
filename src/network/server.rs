//! WebSocket Relay Server
//!
//! Accepts player connections, authenticates the first frame, then runs one
//! read loop and one writer task per connection. All matchmaking state lives
//! in the shared [`Directory`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::network::auth::{authenticate, AuthError};
use crate::network::directory::{Directory, DirectoryError};
use crate::network::outbox::{Outbox, OutboxReceiver, DEFAULT_FRAME_CAPACITY};
use crate::network::protocol::{AuthRequest, ClientMessage, PlayerId, ProtocolError};
use crate::network::session::PlayerSession;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed for the auth frame after the WebSocket handshake.
    pub auth_timeout: Duration,
    /// Capacity of each player's game data lane.
    pub frame_capacity: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            auth_timeout: Duration::from_secs(10),
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("STACKLINE_BIND").unwrap_or(defaults.bind_addr),
            max_connections: env_parse("STACKLINE_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            frame_capacity: env_parse("STACKLINE_FRAME_CAPACITY")
                .unwrap_or(defaults.frame_capacity),
            ..defaults
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind or accept.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Why a connection never got a session.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Socket closed before the auth frame.
    #[error("connection closed before auth")]
    Closed,

    /// Auth frame did not arrive in time.
    #[error("auth timed out")]
    Timeout,

    /// First frame was not an auth message.
    #[error("expected auth, got {0}")]
    UnexpectedMessage(String),

    /// Auth frame could not be decoded.
    #[error("malformed auth frame: {0}")]
    Protocol(#[from] ProtocolError),

    /// Credential rejected.
    #[error("auth rejected: {0}")]
    Auth(#[from] AuthError),

    /// Player id already connected.
    #[error("registration failed: {0}")]
    Directory(#[from] DirectoryError),

    /// Transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client bookkeeping.
#[derive(Debug)]
struct ConnectedClient {
    addr: SocketAddr,
    /// Player identifier (after auth).
    player_id: Option<PlayerId>,
    #[allow(dead_code)]
    connected_at: Instant,
}

type Clients = Arc<RwLock<BTreeMap<Uuid, ConnectedClient>>>;

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    directory: Arc<Directory>,
    clients: Clients,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            directory: Arc::new(Directory::new()),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("Relay server v{} listening on {}", self.config.version, listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr).await;
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

        Ok(())
    }

    /// Spawn the tasks for one connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = Uuid::new_v4();
        let clients = self.clients.clone();
        let directory = self.directory.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        clients.write().await.insert(
            conn_id,
            ConnectedClient { addr, player_id: None, connected_at: Instant::now() },
        );

        tokio::spawn(async move {
            let mut ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    clients.write().await.remove(&conn_id);
                    return;
                }
            };

            let (session, mut outbox_rx) =
                match Self::open_session(&mut ws_stream, &directory, &config).await {
                    Ok(opened) => opened,
                    Err(e) => {
                        warn!("Rejecting {}: {}", addr, e);
                        let _ = ws_stream.close(None).await;
                        clients.write().await.remove(&conn_id);
                        return;
                    }
                };

            if let Some(client) = clients.write().await.get_mut(&conn_id) {
                client.player_id = Some(session.player_id().clone());
            }
            info!("{} connected as {}", addr, session.player_id());

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = outbox_rx.recv().await {
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
                let _ = ws_sender.close().await;
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(Some(client_msg)) => {
                                        let tag = client_msg.tag();
                                        if let Err(e) = session.handle_message(client_msg).await {
                                            debug!("{} [{}]: {}", session.player_id(), tag, e);
                                        }
                                    }
                                    Ok(None) => {
                                        debug!("Ignoring frame from {}: {}", session.player_id(), text);
                                    }
                                    Err(e) => {
                                        warn!("Dropping malformed frame from {}: {}", session.player_id(), e);
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            // Cleanup
            let player_id = session.player_id().clone();
            session.close().await;
            sender_task.abort();
            clients.write().await.remove(&conn_id);

            info!("{} ({}) cleaned up", player_id, addr);
        });
    }

    /// Read the auth frame and register the player.
    async fn open_session(
        ws_stream: &mut WebSocketStream<TcpStream>,
        directory: &Arc<Directory>,
        config: &ServerConfig,
    ) -> Result<(PlayerSession, OutboxReceiver), HandshakeError> {
        let request = timeout(config.auth_timeout, Self::read_auth(ws_stream))
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        let player_id = authenticate(&request)?;
        let (outbox, outbox_rx) = Outbox::channel(config.frame_capacity);
        let session =
            PlayerSession::open(player_id, request.jwt, directory.clone(), outbox).await?;
        Ok((session, outbox_rx))
    }

    /// Wait for the first text frame and require it to be `auth`.
    async fn read_auth(
        ws_stream: &mut WebSocketStream<TcpStream>,
    ) -> Result<AuthRequest, HandshakeError> {
        while let Some(msg) = ws_stream.next().await {
            match msg? {
                Message::Text(text) => {
                    return match ClientMessage::from_json(&text)? {
                        Some(ClientMessage::Auth(request)) => Ok(request),
                        Some(other) => Err(HandshakeError::UnexpectedMessage(other.tag().to_string())),
                        None => Err(HandshakeError::UnexpectedMessage(text)),
                    };
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(HandshakeError::Closed)
    }

    /// Shared matchmaking directory.
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Addresses of connections that have authenticated.
    pub async fn authenticated_peers(&self) -> Vec<(PlayerId, SocketAddr)> {
        self.clients
            .read()
            .await
            .values()
            .filter_map(|c| c.player_id.clone().map(|id| (id, c.addr)))
            .collect()
    }
}
