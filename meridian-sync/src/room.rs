//! A live collaborative room: one authoritative yrs `Doc`, the peers attached
//! to it, and their ephemeral awareness entries.
//!
//! ```text
//!            ┌──────────────────────── Room (room_type:room_id) ─┐
//! Peer A ──► │ apply_update ─► Doc ─► fan-out raw frame ─► B, C  │
//! Peer B ──► │ set_awareness ─► awareness map ─► fan-out ─► A, C │
//! Peer C ──► │ leave ─► drop owned entries ─► removal ─► A, B    │
//!            └───────────────────────────────────────────────────┘
//! ```
//!
//! All mutation happens under one `tokio::sync::Mutex`, so an update is applied
//! and fanned out before any later sync-request for the same room is served.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::key::RoomKey;
use crate::protocol::{
    encode_update_frame, update_payload, AwarenessState, ClientId, ControlMessage, Outbound,
    ProtocolError,
};
use crate::storage::PersistedState;

pub type PeerId = Uuid;

/// A connected participant. Server-owned; never persisted.
pub trait Peer: Send + Sync {
    fn id(&self) -> PeerId;

    /// Queue a frame. Returns `false` if the peer is already gone.
    fn send(&self, frame: Outbound) -> bool;

    fn close(&self);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("room {0} has been evicted")]
    Evicted(RoomKey),
}

struct AwarenessEntry {
    owner: PeerId,
    state: AwarenessState,
}

struct RoomState {
    doc: Doc,
    peers: HashMap<PeerId, Arc<dyn Peer>>,
    awareness: HashMap<ClientId, AwarenessEntry>,
    dirty: bool,
    last_mutation_at: Option<Instant>,
    version: u64,
    evicted: bool,
}

impl RoomState {
    fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Send to everyone but `from`. Returns the number of peers reached.
    fn broadcast(&self, from: Option<PeerId>, frame: &Outbound) -> usize {
        let mut delivered = 0;
        for (id, peer) in &self.peers {
            if Some(*id) == from {
                continue;
            }
            if peer.send(frame.clone()) {
                delivered += 1;
            } else {
                log::debug!("Peer {id} dropped a frame; socket already closed");
            }
        }
        delivered
    }
}

pub struct Room {
    key: RoomKey,
    /// Serializes flushes of this room (debounce timer vs. eviction vs. shutdown).
    pub(crate) persist_lock: Mutex<()>,
    state: Mutex<RoomState>,
}

impl Room {
    /// Empty room with a fresh document.
    pub fn new(key: RoomKey) -> Self {
        Self::with_doc(key, Doc::new(), 0)
    }

    fn with_doc(key: RoomKey, doc: Doc, version: u64) -> Self {
        Self {
            key,
            persist_lock: Mutex::new(()),
            state: Mutex::new(RoomState {
                doc,
                peers: HashMap::new(),
                awareness: HashMap::new(),
                dirty: false,
                last_mutation_at: None,
                version,
                evicted: false,
            }),
        }
    }

    /// Room seeded from a persisted record. A blob that does not decode is
    /// logged and the room starts empty, keeping the stored version so the
    /// next write still supersedes it.
    pub fn rehydrate(key: RoomKey, persisted: PersistedState) -> Self {
        let mut doc = Doc::new();
        let applied = Update::decode_v1(&persisted.blob)
            .map_err(|e| e.to_string())
            .and_then(|update| {
                let mut txn = doc.transact_mut();
                txn.apply_update(update).map_err(|e| e.to_string())
            });
        match applied {
            Ok(()) => log::info!(
                "Rehydrated room {key} at version {} ({} bytes)",
                persisted.version,
                persisted.blob.len()
            ),
            Err(e) => {
                log::error!("Stored state for room {key} is corrupt, starting empty: {e}");
                doc = Doc::new();
            }
        }
        Self::with_doc(key, doc, persisted.version)
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Attach a peer and unicast the current snapshot plus the presence of
    /// everyone already here. Returns the new peer count.
    pub async fn join(&self, peer: Arc<dyn Peer>) -> Result<usize, RoomError> {
        let mut state = self.state.lock().await;
        if state.evicted {
            return Err(RoomError::Evicted(self.key.clone()));
        }

        peer.send(Outbound::Binary(encode_update_frame(&state.snapshot())));
        for (client_id, entry) in &state.awareness {
            let msg = ControlMessage::awareness(client_id.clone(), Some(entry.state.clone()));
            if let Some(frame) = Outbound::control(&msg) {
                peer.send(frame);
            }
        }

        let id = peer.id();
        state.peers.insert(id, peer);
        log::info!("Peer {id} joined room {} ({} peers)", self.key, state.peers.len());
        Ok(state.peers.len())
    }

    /// Validate, apply and fan out one binary frame. The raw frame is forwarded
    /// unchanged. Nothing is applied or forwarded on error.
    pub async fn apply_update(&self, from: PeerId, frame: Bytes) -> Result<usize, ProtocolError> {
        let payload = update_payload(&frame)?;

        // `Update` is not `Send`: decode only once the lock is held.
        let mut state = self.state.lock().await;
        {
            let update = Update::decode_v1(payload)
                .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
            let mut txn = state.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
        }
        state.dirty = true;
        state.last_mutation_at = Some(Instant::now());

        let delivered = state.broadcast(Some(from), &Outbound::Binary(frame));
        log::debug!("Room {}: update from {from} fanned out to {delivered}", self.key);
        Ok(delivered)
    }

    /// Replace (or with `None`, remove) one awareness entry and forward the
    /// original message text to the other peers.
    pub async fn set_awareness(
        &self,
        from: PeerId,
        client_id: ClientId,
        awareness: Option<AwarenessState>,
        raw: Arc<str>,
    ) -> usize {
        let mut state = self.state.lock().await;
        match awareness {
            Some(next) => {
                if let Some(entry) = state.awareness.get(&client_id) {
                    if entry.owner != from {
                        log::warn!(
                            "Room {}: peer {from} tried to replace awareness of {client_id} it does not own",
                            self.key
                        );
                        return 0;
                    }
                }
                state.awareness.insert(
                    client_id,
                    AwarenessEntry {
                        owner: from,
                        state: next,
                    },
                );
            }
            None => match state.awareness.get(&client_id) {
                Some(entry) if entry.owner == from => {
                    state.awareness.remove(&client_id);
                }
                Some(_) => {
                    log::warn!(
                        "Room {}: peer {from} tried to clear awareness of {client_id} it does not own",
                        self.key
                    );
                    return 0;
                }
                None => return 0,
            },
        }
        let delivered = state.broadcast(Some(from), &Outbound::Text(raw));
        log::trace!("Room {}: awareness from {from} fanned out to {delivered}", self.key);
        delivered
    }

    /// Detach a peer, drop the awareness it owned and tell the others.
    /// Returns the remaining peer count.
    pub async fn leave(&self, peer_id: PeerId) -> usize {
        let mut state = self.state.lock().await;
        if state.peers.remove(&peer_id).is_none() {
            return state.peers.len();
        }

        let owned: Vec<ClientId> = state
            .awareness
            .iter()
            .filter(|(_, entry)| entry.owner == peer_id)
            .map(|(client_id, _)| client_id.clone())
            .collect();
        for client_id in owned {
            state.awareness.remove(&client_id);
            if let Some(frame) = Outbound::control(&ControlMessage::awareness(client_id, None)) {
                state.broadcast(None, &frame);
            }
        }

        log::info!("Peer {peer_id} left room {} ({} peers)", self.key, state.peers.len());
        state.peers.len()
    }

    /// Unicast the full document to one peer (sync-request).
    pub async fn send_snapshot(&self, peer_id: PeerId) -> bool {
        let state = self.state.lock().await;
        match state.peers.get(&peer_id) {
            Some(peer) => peer.send(Outbound::Binary(encode_update_frame(&state.snapshot()))),
            None => false,
        }
    }

    /// Full document state as a yrs v1 update.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.state.lock().await.snapshot()
    }

    /// Current awareness states of every client in the room.
    pub async fn users(&self) -> Vec<AwarenessState> {
        let state = self.state.lock().await;
        state.awareness.values().map(|e| e.state.clone()).collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Version of the last persisted (or rehydrated) state.
    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    pub async fn last_mutation_at(&self) -> Option<Instant> {
        self.state.lock().await.last_mutation_at
    }

    /// Clear the dirty flag and hand out the state to persist under the next
    /// version. `None` when nothing changed since the last write.
    pub(crate) async fn take_dirty(&self) -> Option<(Vec<u8>, u64)> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        state.version += 1;
        Some((state.snapshot(), state.version))
    }

    /// Re-arm after a failed write so the next trigger retries.
    pub(crate) async fn mark_dirty(&self) {
        self.state.lock().await.dirty = true;
    }

    /// Refuse further joins if nobody is attached. Returns whether the room
    /// is now closed.
    pub(crate) async fn close_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.peers.is_empty() {
            state.evicted = true;
        }
        state.evicted
    }

    /// Close every attached socket.
    pub(crate) async fn close_peers(&self) {
        let state = self.state.lock().await;
        for peer in state.peers.values() {
            peer.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{AwarenessUser, CursorPosition};
    use std::sync::atomic::{AtomicBool, Ordering};
    use yrs::{GetString, Text};

    /// Records everything it is sent.
    pub(crate) struct RecordingPeer {
        id: PeerId,
        pub(crate) frames: std::sync::Mutex<Vec<Outbound>>,
        closed: AtomicBool,
    }

    impl RecordingPeer {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                frames: std::sync::Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        pub(crate) fn take(&self) -> Vec<Outbound> {
            std::mem::take(&mut *self.frames.lock().unwrap())
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Peer for RecordingPeer {
        fn id(&self) -> PeerId {
            self.id
        }

        fn send(&self, frame: Outbound) -> bool {
            self.frames.lock().unwrap().push(frame);
            true
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// A text insert as a framed yrs update, produced by an independent doc.
    pub(crate) fn text_frame(client_id: u64, text: &str) -> Bytes {
        let doc = Doc::with_client_id(client_id);
        let shared = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        shared.insert(&mut txn, 0, text);
        encode_update_frame(&txn.encode_update_v1())
    }

    pub(crate) fn text_of(snapshot: &[u8]) -> String {
        let doc = Doc::new();
        let shared = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(snapshot).unwrap()).unwrap();
        shared.get_string(&txn)
    }

    fn key() -> RoomKey {
        RoomKey::parse("text", "notes").unwrap()
    }

    #[tokio::test]
    async fn test_join_unicasts_snapshot() {
        let room = Room::new(key());
        let a = RecordingPeer::new();
        assert_eq!(room.join(a.clone()).await.unwrap(), 1);

        let frames = a.take();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Outbound::Binary(b) => assert!(update_payload(b).is_ok()),
            other => panic!("Expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_fans_out_to_others_only() {
        let room = Room::new(key());
        let a = RecordingPeer::new();
        let b = RecordingPeer::new();
        room.join(a.clone()).await.unwrap();
        room.join(b.clone()).await.unwrap();
        a.take();
        b.take();

        let frame = text_frame(1, "hello");
        assert_eq!(room.apply_update(a.id(), frame.clone()).await.unwrap(), 1);

        assert!(a.take().is_empty());
        assert_eq!(b.take(), vec![Outbound::Binary(frame)]);
        assert!(room.is_dirty().await);
        assert!(room.last_mutation_at().await.is_some());
        assert_eq!(text_of(&room.snapshot().await), "hello");
    }

    #[tokio::test]
    async fn test_invalid_frames_are_not_applied_or_forwarded() {
        let room = Room::new(key());
        let a = RecordingPeer::new();
        let b = RecordingPeer::new();
        room.join(a.clone()).await.unwrap();
        room.join(b.clone()).await.unwrap();
        b.take();
        let before = room.snapshot().await;

        assert!(room.apply_update(a.id(), Bytes::from_static(&[0])).await.is_err());
        assert!(room.apply_update(a.id(), Bytes::from_static(&[1, 2, 3])).await.is_err());

        assert!(b.take().is_empty());
        assert!(!room.is_dirty().await);
        assert_eq!(room.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_duplicate_and_reordered_updates_converge() {
        let first = text_frame(1, "a");
        let second = text_frame(2, "b");

        let r1 = Room::new(key());
        let r2 = Room::new(key());
        let peer = Uuid::new_v4();
        r1.apply_update(peer, first.clone()).await.unwrap();
        r1.apply_update(peer, second.clone()).await.unwrap();
        r2.apply_update(peer, second.clone()).await.unwrap();
        r2.apply_update(peer, first.clone()).await.unwrap();
        r2.apply_update(peer, first).await.unwrap();

        assert_eq!(text_of(&r1.snapshot().await), text_of(&r2.snapshot().await));
    }

    #[tokio::test]
    async fn test_awareness_replace_and_leave() {
        let room = Room::new(key());
        let a = RecordingPeer::new();
        let b = RecordingPeer::new();
        room.join(a.clone()).await.unwrap();
        room.join(b.clone()).await.unwrap();
        a.take();
        b.take();

        let mut state = AwarenessState::for_user(AwarenessUser {
            id: "u-a".into(),
            name: "Ada".into(),
            color: "#ff0000".into(),
        });
        state.cursor = Some(CursorPosition { x: 1.0, y: 1.0 });
        room.set_awareness(a.id(), ClientId::Num(7), Some(state.clone()), Arc::from("raw-1"))
            .await;
        assert_eq!(b.take(), vec![Outbound::text("raw-1")]);

        state.cursor = None;
        room.set_awareness(a.id(), ClientId::Num(7), Some(state.clone()), Arc::from("raw-2"))
            .await;
        assert_eq!(room.users().await, vec![state]);

        assert_eq!(room.leave(a.id()).await, 1);
        assert!(room.users().await.is_empty());
        let removal = b.take();
        assert_eq!(removal.len(), 2);
        assert_eq!(
            removal[1],
            Outbound::text(r#"{"type":"awareness","clientId":7,"state":null}"#)
        );
    }

    #[tokio::test]
    async fn test_join_replays_existing_presence() {
        let room = Room::new(key());
        let a = RecordingPeer::new();
        room.join(a.clone()).await.unwrap();
        room.set_awareness(
            a.id(),
            ClientId::from("a"),
            Some(AwarenessState::default()),
            Arc::from("{}"),
        )
        .await;

        let b = RecordingPeer::new();
        room.join(b.clone()).await.unwrap();
        let frames = b.take();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Outbound::Binary(_)));
        assert!(matches!(frames[1], Outbound::Text(_)));
    }

    #[tokio::test]
    async fn test_take_dirty_bumps_version_once() {
        let room = Room::new(key());
        assert!(room.take_dirty().await.is_none());

        room.apply_update(Uuid::new_v4(), text_frame(1, "x")).await.unwrap();
        let (blob, version) = room.take_dirty().await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(text_of(&blob), "x");
        assert!(room.take_dirty().await.is_none());
    }

    #[tokio::test]
    async fn test_rehydrate_restores_doc_and_version() {
        let source = Room::new(key());
        source.apply_update(Uuid::new_v4(), text_frame(3, "saved")).await.unwrap();
        let persisted = PersistedState::new(&key(), source.snapshot().await, 4);

        let room = Room::rehydrate(key(), persisted);
        assert_eq!(room.version().await, 4);
        assert_eq!(text_of(&room.snapshot().await), "saved");
        assert!(!room.is_dirty().await);
    }

    #[tokio::test]
    async fn test_rehydrate_corrupt_blob_starts_empty() {
        let persisted = PersistedState::new(&key(), vec![0xff, 0xff, 0xff], 2);
        let room = Room::rehydrate(key(), persisted);
        assert_eq!(room.version().await, 2);
        assert_eq!(text_of(&room.snapshot().await), "");
    }

    #[tokio::test]
    async fn test_closed_room_refuses_joins() {
        let room = Room::new(key());
        assert!(room.close_if_empty().await);
        let err = room.join(RecordingPeer::new()).await.unwrap_err();
        assert_eq!(err, RoomError::Evicted(key()));
    }

    #[tokio::test]
    async fn test_apply_update_runs_on_spawned_task() {
        let room = Arc::new(Room::new(key()));
        let handle = tokio::spawn({
            let room = room.clone();
            async move { room.apply_update(Uuid::new_v4(), text_frame(1, "sent")).await }
        });
        assert_eq!(handle.await.unwrap().unwrap(), 0);
        assert_eq!(text_of(&room.snapshot().await), "sent");
    }

    #[tokio::test]
    async fn test_awareness_of_another_owner_is_not_replaced() {
        let room = Room::new(key());
        let a = RecordingPeer::new();
        let b = RecordingPeer::new();
        room.join(a.clone()).await.unwrap();
        room.join(b.clone()).await.unwrap();
        a.take();
        b.take();

        let owned = AwarenessState {
            selected_node_id: Some("mine".into()),
            ..AwarenessState::default()
        };
        room.set_awareness(a.id(), ClientId::Num(7), Some(owned.clone()), Arc::from("a"))
            .await;
        b.take();

        let stolen = AwarenessState {
            selected_node_id: Some("theirs".into()),
            ..AwarenessState::default()
        };
        assert_eq!(
            room.set_awareness(b.id(), ClientId::Num(7), Some(stolen), Arc::from("b"))
                .await,
            0
        );
        assert!(a.take().is_empty());
        assert_eq!(room.users().await, vec![owned]);

        // The real owner's departure still clears the entry.
        room.leave(a.id()).await;
        assert!(room.users().await.is_empty());
        assert_eq!(
            b.take(),
            vec![Outbound::text(r#"{"type":"awareness","clientId":7,"state":null}"#)]
        );
    }
}
