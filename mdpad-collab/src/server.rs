//! Reference document server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/api/socket/{id}
//!             ├── RoomManager ── DocumentRoom (id)
//! Client B ──┘                     │  text · history · presence
//!                                  │
//!                          broadcast::Sender<RoomEvent>
//!                          ┌───────┴────────┐
//!                          ▼                ▼
//!                  A: ack / others'   B: ack / others'
//! ```
//!
//! The server sequences operations: it assigns revisions, transforms late
//! operations over the history they missed and relays presence. It keeps
//! everything in memory; rooms whose id has expired are swept once nobody
//! is connected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::room::{DocumentRoom, RoomError, RoomEvent, RoomManager};
use crate::share::{self, SOCKET_PATH};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("rejected operation: {0}")]
    Rejected(#[from] RoomError),

    #[error("no document id in request path")]
    MissingDocument,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events a connection may fall behind before it is dropped
    pub broadcast_capacity: usize,
    /// How often expired rooms are swept
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3030".to_string(),
            broadcast_capacity: 256,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// The document server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Current text of a document, if its room exists.
    pub async fn document_text(&self, document_id: &str) -> Option<String> {
        Some(self.rooms.get(document_id).await?.text())
    }

    pub async fn document_revision(&self, document_id: &str) -> Option<u64> {
        Some(self.rooms.get(document_id).await?.revision())
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Document server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let sweeper = tokio::spawn(Self::sweep_rooms(
            self.rooms.clone(),
            self.config.sweep_interval,
        ));

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::warn!("Connection from {addr} closed: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    async fn sweep_rooms(rooms: Arc<RoomManager>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            ticker.tick().await;
            rooms.sweep_expired(share::unix_now()).await;
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        let mut document_id = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                match request.uri().path().strip_prefix(SOCKET_PATH) {
                    Some(id) if !id.is_empty() && !id.contains('/') => {
                        document_id = Some(id.to_owned());
                        Ok(response)
                    }
                    _ => {
                        let mut rejection = ErrorResponse::new(Some("unknown endpoint".into()));
                        *rejection.status_mut() = StatusCode::NOT_FOUND;
                        Err(rejection)
                    }
                }
            },
        )
        .await?;
        let document_id = document_id.ok_or(ServerError::MissingDocument)?;

        let (room, joined) = rooms.join(&document_id).await;
        let user_id = joined.user_id;
        log::info!("User {user_id} from {addr} joined {document_id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut sink, mut source) = ws_stream.split();
        let result = Self::relay(
            &room,
            user_id,
            joined.greeting,
            joined.events,
            &mut sink,
            &mut source,
            &stats,
        )
        .await;

        room.leave(user_id);
        let _ = sink.close().await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("User {user_id} left {document_id}");
        result
    }

    async fn relay(
        room: &DocumentRoom,
        user_id: u64,
        greeting: Vec<ServerMessage>,
        mut events: broadcast::Receiver<Arc<RoomEvent>>,
        sink: &mut WsSink,
        source: &mut WsSource,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), ServerError> {
        for message in greeting {
            sink.send(Message::Text(message.encode()?.into())).await?;
        }

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        stats.write().await.total_messages += 1;
                        Self::handle_message(room, user_id, text.as_str())?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(message) = event.for_user(user_id) {
                            log::trace!("-> user {user_id}: {:?}", message.kind());
                            sink.send(Message::Text(message.encode()?.into())).await?;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Its history has a gap; the client resyncs on reconnect.
                        log::warn!("User {user_id} lagged by {missed} events, disconnecting");
                        return Ok(());
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    fn handle_message(room: &DocumentRoom, user_id: u64, text: &str) -> Result<(), ServerError> {
        match ClientMessage::decode(text)? {
            ClientMessage::Operation { revision, ops } => {
                let accepted = room.apply_operation(user_id, revision, ops)?;
                log::debug!("User {user_id} operation on r{revision} accepted as r{accepted}");
            }
            ClientMessage::Identity { name, hue } => {
                let profile = mdpad_core::UserProfile::new(name, hue);
                if profile.is_valid() {
                    room.set_identity(user_id, profile);
                } else {
                    log::debug!("Ignoring identity of user {user_id} with hue {hue}");
                }
            }
            ClientMessage::SelectionUpdate { ranges } => room.set_selection(user_id, ranges),
            ClientMessage::LanguageChange { language } => room.set_language(user_id, language),
        }
        Ok(())
    }
}
