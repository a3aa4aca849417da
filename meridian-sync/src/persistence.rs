//! Debounced durable writes.
//!
//! Every mutation re-arms a per-room timer; only when a room has been quiet for
//! one debounce window is its full state written. K updates inside one window
//! therefore cost a single `put`, carrying the state after the Kth update.
//!
//! ```text
//! update ─► schedule(room) ─► abort previous timer ─► spawn(sleep ─► flush_now)
//!                                                                    │
//!                               persist_lock ─► take_dirty ─► store.put
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::key::RoomKey;
use crate::room::Room;
use crate::storage::{DocumentStore, PersistedState, StoreError};

pub struct PersistenceScheduler {
    store: Arc<dyn DocumentStore>,
    debounce: Duration,
    /// At most one pending timer per room, tagged with the generation that armed it.
    timers: Mutex<HashMap<RoomKey, (u64, AbortHandle)>>,
    next_generation: AtomicU64,
    writes: AtomicU64,
}

impl PersistenceScheduler {
    pub fn new(store: Arc<dyn DocumentStore>, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            timers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// (Re)arm the debounce timer for `room`.
    pub fn schedule(self: &Arc<Self>, room: &Arc<Room>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let key = room.key().clone();

        let scheduler = Arc::clone(self);
        let target = Arc::clone(room);
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            scheduler.clear_timer(target.key(), generation);
            if let Err(e) = scheduler.flush_now(&target).await {
                log::error!("Debounced flush of room {} failed: {e}", target.key());
            }
        })
        .abort_handle();

        let previous = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (generation, handle));
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    /// Drop a pending timer without flushing.
    pub fn cancel(&self, key: &RoomKey) {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some((_, handle)) = removed {
            handle.abort();
        }
    }

    pub fn has_pending(&self, key: &RoomKey) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Write the room now if it is dirty. Returns whether a write happened.
    ///
    /// On failure the room is marked dirty again so the next trigger retries.
    pub async fn flush_now(&self, room: &Room) -> Result<bool, StoreError> {
        let _guard = room.persist_lock.lock().await;
        let Some((blob, version)) = room.take_dirty().await else {
            return Ok(false);
        };

        let state = PersistedState::new(room.key(), blob, version);
        match self.store.put(room.key(), &state) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Persisted room {} at version {version} ({} bytes)",
                    room.key(),
                    state.blob.len()
                );
                Ok(true)
            }
            Err(e) => {
                room.mark_dirty().await;
                Err(e)
            }
        }
    }

    /// Successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn clear_timer(&self, key: &RoomKey, generation: u64) {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(timers.get(key), Some((g, _)) if *g == generation) {
            timers.remove(key);
        }
    }
}
