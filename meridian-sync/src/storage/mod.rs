//! Durable storage for room documents.
//!
//! ```text
//! ┌──────────────────────┐   put(key, state)   ┌──────────────────┐
//! │ PersistenceScheduler │ ──────────────────► │ DocumentStore    │
//! │ (debounced flush)    │                     │  RocksStore      │
//! └──────────────────────┘                     │  MemoryStore     │
//!            ▲                                 └────────┬─────────┘
//!            │ get(key) on room creation                │
//! ┌──────────┴───────────┐                              │
//! │ RoomManager          │ ◄────────────────────────────┘
//! └──────────────────────┘
//! ```
//!
//! The store is an opaque versioned blob store: one record per room key,
//! no query capability.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

use crate::key::{RoomId, RoomKey, RoomType};

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persisted snapshot of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub room_type: RoomType,
    pub room_id: RoomId,
    /// Full yrs document state (`encode_state_as_update_v1`).
    pub blob: Vec<u8>,
    /// Strictly increasing per room key.
    pub version: u64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

impl PersistedState {
    pub fn new(key: &RoomKey, blob: Vec<u8>, version: u64) -> Self {
        Self {
            room_type: key.room_type.clone(),
            room_id: key.room_id.clone(),
            blob,
            version,
            updated_at: now_millis(),
        }
    }

    pub fn key(&self) -> RoomKey {
        RoomKey::new(self.room_type.clone(), self.room_id.clone())
    }
}

/// Versioned blob store keyed by `(room_type, room_id)`.
///
/// Calls are synchronous; they run on persistence timer tasks, never on the
/// per-message path.
pub trait DocumentStore: Send + Sync {
    fn put(&self, key: &RoomKey, state: &PersistedState) -> Result<(), StoreError>;

    fn get(&self, key: &RoomKey) -> Result<Option<PersistedState>, StoreError>;
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
