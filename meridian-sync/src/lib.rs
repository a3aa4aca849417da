//! # meridian-sync — Real-time document sync over WebSockets
//!
//! Rooms hold one authoritative yrs document each; peers exchange binary
//! update frames and JSON presence messages over a single WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket: [0x00][update] │ JSON   ┌──────────────┐
//! │ Connection   │ ◄────────────────────────────────────► │ SyncServer   │
//! │ (per client) │                                        │ (axum)       │
//! └──────┬───────┘                                        └──────┬───────┘
//!        │                                                       │
//!        ▼                                                       ▼
//! ┌──────────────┐                                        ┌──────────────┐
//! │ SyncAdapter  │ map/array/text views                   │ RoomManager  │
//! │ Presence     │ cursors, selections                    │  Room × N    │
//! └──────────────┘                                        └──────┬───────┘
//!                                                                │ debounced
//!                                                         ┌──────┴───────┐
//!                                                         │ DocumentStore│
//!                                                         │ (RocksDB)    │
//!                                                         └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`key`] — Validated `(room_type, room_id)` identity
//! - [`protocol`] — Binary update frames and JSON control messages
//! - [`room`] — One live room: doc, peers, awareness
//! - [`registry`] — Room lookup, rehydration and idle eviction
//! - [`persistence`] — Debounced snapshot writes
//! - [`storage`] — Durable stores (RocksDB, in-memory)
//! - [`server`] — HTTP/WebSocket surface
//! - [`client`] — Reconnecting client connection
//! - [`adapter`] — Typed views over shared structures
//! - [`presence`] — Local presence and remote user queries
//! - [`shim`] — Awareness facade for editor extensions

pub mod key;
pub mod protocol;
pub mod room;
pub mod registry;
pub mod persistence;
pub mod storage;
pub mod server;
pub mod config;
pub mod client;
pub mod adapter;
pub mod presence;
pub mod shim;

// Re-exports for convenience
pub use key::{KeyError, RoomId, RoomKey, RoomType};
pub use protocol::{
    AwarenessState, AwarenessUser, ClientId, ControlMessage, CursorPosition, GhostNode, Inbound,
    Outbound, ProtocolError, SelectionRange,
};
pub use room::{Peer, PeerId, Room, RoomError};
pub use registry::RoomManager;
pub use persistence::PersistenceScheduler;
pub use storage::{DocumentStore, MemoryStore, PersistedState, RocksStore, StoreConfig, StoreError};
pub use server::{ServerError, SyncHandler, SyncServer, UsersResponse};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use client::{Connection, ConnectionError, ConnectionStatus, ConnectionView};
pub use adapter::{AdapterError, SyncAdapter, SyncedArray, SyncedFragment, SyncedMap, SyncedText};
pub use presence::{
    AnonymousUser, AwarenessTransport, CurrentUserProvider, NodePresenceStyle, PresenceManager,
    StaticUser,
};
pub use shim::{CollaborationProvider, EditorAwareness};
