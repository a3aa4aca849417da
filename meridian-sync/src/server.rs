//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  GET /rooms/{roomId}/ws?type={roomType}
//!             ├── SyncHandler ── Room (type:id) ── yrs Doc
//! Client B ──┘                       │
//!                                    ├── awareness map
//!                                    └── PersistenceScheduler ── DocumentStore
//!
//! GET /rooms/{roomId}/users?type={roomType}  → {"users":[...],"count":n}
//! GET /health                                → ok
//! ```
//!
//! Each socket gets one reader loop (this module) and one writer task fed by
//! an unbounded channel; rooms only ever talk to the writer through [`Peer`].

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{ConfigError, ServerConfig};
use crate::key::RoomKey;
use crate::protocol::{AwarenessState, ControlMessage, Inbound, Outbound, ProtocolError};
use crate::registry::RoomManager;
use crate::room::{Peer, PeerId, Room};
use crate::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Routes decoded frames from one peer into its room.
pub struct SyncHandler {
    rooms: Arc<RoomManager>,
    max_frame_bytes: usize,
}

impl SyncHandler {
    pub fn new(rooms: Arc<RoomManager>, max_frame_bytes: usize) -> Self {
        Self {
            rooms,
            max_frame_bytes,
        }
    }

    /// Handle one inbound frame. Errors mean the frame was dropped; the
    /// connection stays usable.
    pub async fn handle(
        &self,
        room: &Arc<Room>,
        peer: &dyn Peer,
        frame: Inbound,
    ) -> Result<(), ProtocolError> {
        if frame.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_bytes,
            });
        }

        match frame {
            Inbound::Binary(bytes) => {
                room.apply_update(peer.id(), bytes).await?;
                self.rooms.schedule_persist(room);
            }
            Inbound::Text(text) => match ControlMessage::parse(&text)? {
                ControlMessage::Awareness { client_id, state } => {
                    room.set_awareness(peer.id(), client_id, state, Arc::from(text))
                        .await;
                }
                ControlMessage::SyncRequest => {
                    log::debug!("Peer {} requested a snapshot of {}", peer.id(), room.key());
                    room.send_snapshot(peer.id()).await;
                }
                ControlMessage::Ping => {
                    if let Some(pong) = Outbound::control(&ControlMessage::Pong) {
                        peer.send(pong);
                    }
                }
                ControlMessage::Pong => {
                    log::trace!("Pong from peer {}", peer.id());
                }
            },
        }
        Ok(())
    }

    /// Detach the peer and release the room if it emptied.
    pub async fn leave(&self, room: &Arc<Room>, peer_id: PeerId) {
        self.rooms.leave(room, peer_id).await;
    }
}

enum PeerCommand {
    Frame(Outbound),
    Close,
}

/// A peer backed by a WebSocket writer task.
struct SocketPeer {
    id: PeerId,
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl Peer for SocketPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn send(&self, frame: Outbound) -> bool {
        self.tx.send(PeerCommand::Frame(frame)).is_ok()
    }

    fn close(&self) {
        let _ = self.tx.send(PeerCommand::Close);
    }
}

#[derive(Clone)]
struct AppState {
    rooms: Arc<RoomManager>,
    config: Arc<ServerConfig>,
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    #[serde(rename = "type")]
    room_type: String,
}

/// Body of `GET /rooms/{roomId}/users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsersResponse {
    pub users: Vec<AwarenessState>,
    pub count: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
}

impl SyncServer {
    /// Open the configured store (RocksDB if `storage_path` is set, memory
    /// otherwise) and build the server.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => {
                log::warn!("No storage path configured, documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let rooms = Arc::new(RoomManager::new(
            store,
            config.persistence_debounce(),
            config.eviction_grace(),
        ));
        Self { config, rooms }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/rooms/{room_id}/ws", get(ws_upgrade))
            .route("/rooms/{room_id}/users", get(room_users))
            .with_state(AppState {
                rooms: self.rooms.clone(),
                config: Arc::new(self.config.clone()),
            })
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener. On shutdown every socket is
    /// closed and every dirty room is flushed before this returns.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let rooms = self.rooms.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                log::info!("Shutting down, closing all sockets");
                rooms.close_all().await;
            })
            .await?;

        self.rooms.flush_all().await;
        Ok(())
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(query): Query<RoomQuery>,
    State(state): State<AppState>,
) -> Response {
    match RoomKey::parse(&query.room_type, &room_id) {
        Ok(key) => ws.on_upgrade(move |socket| handle_socket(socket, key, state)),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn room_users(
    Path(room_id): Path<String>,
    Query(query): Query<RoomQuery>,
    State(state): State<AppState>,
) -> Response {
    let key = match RoomKey::parse(&query.room_type, &room_id) {
        Ok(key) => key,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let users = match state.rooms.get(&key).await {
        Some(room) => room.users().await,
        None => Vec::new(),
    };
    Json(UsersResponse {
        count: users.len(),
        users,
    })
    .into_response()
}

/// Handle a single WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, key: RoomKey, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let peer = Arc::new(SocketPeer {
        id: Uuid::new_v4(),
        tx,
    });
    let peer_id = peer.id;

    let writer = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let message = match command {
                PeerCommand::Frame(Outbound::Binary(bytes)) => Message::Binary(bytes),
                PeerCommand::Frame(Outbound::Text(text)) => Message::Text(text.to_string().into()),
                PeerCommand::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = sink.send(message).await {
                log::debug!("Write to peer {peer_id} failed: {e}");
                break;
            }
        }
    });

    // The snapshot is queued on join, before any frame from this peer is read.
    let room = match state.rooms.join(&key, peer.clone()).await {
        Ok(room) => room,
        Err(e) => {
            log::error!("Refusing peer {peer_id}: room {key} could not be loaded: {e}");
            peer.close();
            drop(peer);
            let _ = writer.await;
            return;
        }
    };
    let handler = SyncHandler::new(state.rooms.clone(), state.config.max_frame_bytes);
    let mut heartbeat = state.config.heartbeat_interval().map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            msg = stream.next() => {
                let frame = match msg {
                    Some(Ok(Message::Binary(bytes))) => Inbound::Binary(bytes),
                    Some(Ok(Message::Text(text))) => Inbound::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Peer {peer_id} closed its socket");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from peer {peer_id}: {e}");
                        break;
                    }
                };
                if let Err(e) = handler.handle(&room, peer.as_ref(), frame).await {
                    log::warn!("Dropped frame from peer {peer_id} in room {key}: {e}");
                }
            }
            _ = tick(&mut heartbeat) => {
                if let Some(ping) = Outbound::control(&ControlMessage::Ping) {
                    peer.send(ping);
                }
            }
        }
    }

    handler.leave(&room, peer_id).await;
    drop(peer);
    let _ = writer.await;
}

async fn tick(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
