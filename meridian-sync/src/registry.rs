//! Room manager: maps room keys to live rooms.
//!
//! Each `(room_type, room_id)` gets exactly one `Room` per process. Rooms are
//! created lazily on first join, rehydrated from the durable store before they
//! become visible, and evicted once they have stayed empty for a grace period.
//!
//! Lock order: `rooms` ─► `Room::persist_lock` ─► room state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::key::RoomKey;
use crate::persistence::PersistenceScheduler;
use crate::room::{Peer, PeerId, Room, RoomError};
use crate::storage::{DocumentStore, StoreError};

pub struct RoomManager {
    rooms: RwLock<HashMap<RoomKey, Arc<Room>>>,
    store: Arc<dyn DocumentStore>,
    persistence: Arc<PersistenceScheduler>,
    eviction_grace: Duration,
}

impl RoomManager {
    pub fn new(store: Arc<dyn DocumentStore>, debounce: Duration, eviction_grace: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            persistence: Arc::new(PersistenceScheduler::new(store.clone(), debounce)),
            store,
            eviction_grace,
        }
    }

    pub fn persistence(&self) -> &Arc<PersistenceScheduler> {
        &self.persistence
    }

    /// Get or create the room for `key`. A new room is rehydrated from the
    /// store while the write lock is held, so nobody can join it early.
    ///
    /// A failed store read publishes nothing: a room started empty would
    /// later overwrite the stored record with a lower version.
    pub async fn get_or_create(&self, key: &RoomKey) -> Result<Arc<Room>, StoreError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return Ok(room.clone());
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            return Ok(room.clone());
        }

        let room = match self.store.get(key) {
            Ok(Some(persisted)) => Room::rehydrate(key.clone(), persisted),
            Ok(None) => {
                log::info!("Created room {key}");
                Room::new(key.clone())
            }
            Err(e) => {
                log::error!("Failed to load room {key}: {e}");
                return Err(e);
            }
        };
        let room = Arc::new(room);
        rooms.insert(key.clone(), room.clone());
        Ok(room)
    }

    /// Live room for `key`, without creating one.
    pub async fn get(&self, key: &RoomKey) -> Option<Arc<Room>> {
        self.rooms.read().await.get(key).cloned()
    }

    /// Attach a peer to the room for `key`, retrying if the room was evicted
    /// between lookup and join.
    pub async fn join(&self, key: &RoomKey, peer: Arc<dyn Peer>) -> Result<Arc<Room>, StoreError> {
        loop {
            let room = self.get_or_create(key).await?;
            match room.join(peer.clone()).await {
                Ok(_) => return Ok(room),
                Err(RoomError::Evicted(_)) => {
                    log::debug!("Room {key} was evicted during join, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Arm the debounced write for `room`.
    pub fn schedule_persist(&self, room: &Arc<Room>) {
        self.persistence.schedule(room);
    }

    /// Detach a peer. If the room is now empty its eviction is scheduled.
    pub async fn leave(self: &Arc<Self>, room: &Arc<Room>, peer_id: PeerId) {
        if room.leave(peer_id).await == 0 {
            self.release(room);
        }
    }

    /// Schedule eviction of an empty room after the grace period.
    pub fn release(self: &Arc<Self>, room: &Arc<Room>) {
        let manager = Arc::clone(self);
        let key = room.key().clone();
        let grace = self.eviction_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match manager.evict_if_idle(&key).await {
                Ok(true) => {}
                Ok(false) => log::debug!("Room {key} is active again, keeping it"),
                Err(e) => log::error!("Eviction of room {key} failed: {e}"),
            }
        });
    }

    /// Flush and remove the room if nobody is attached. Returns whether it
    /// was evicted. A failed flush keeps the room alive.
    pub async fn evict_if_idle(&self, key: &RoomKey) -> Result<bool, StoreError> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(key).cloned() else {
            return Ok(false);
        };
        if room.peer_count().await > 0 {
            return Ok(false);
        }

        self.persistence.cancel(key);
        self.persistence.flush_now(&room).await?;
        if !room.close_if_empty().await {
            return Ok(false);
        }
        rooms.remove(key);
        log::info!("Evicted room {key} ({} rooms live)", rooms.len());
        Ok(true)
    }

    /// Persist every dirty room. Used on shutdown.
    pub async fn flush_all(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut written = 0;
        for room in rooms {
            self.persistence.cancel(room.key());
            match self.persistence.flush_now(&room).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => log::error!("Failed to flush room {}: {e}", room.key()),
            }
        }
        log::info!("Flushed {written} dirty rooms");
        written
    }

    /// Close every socket in every room.
    pub async fn close_all(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            room.close_peers().await;
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomKey> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
