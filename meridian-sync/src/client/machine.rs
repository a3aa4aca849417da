//! Connection state machine, free of I/O.
//!
//! ```text
//!            connect()              socket open
//!   Idle ─────────────► Connecting ────────────► Open
//!    ▲                     ▲   │                   │
//!    │                     │   │ error/close       │ error/close
//!    │        backoff fires│   ▼                   ▼
//!    │                   Erroring ◄────────────────┘
//!    │
//!   disconnect() from any state ─► Closed (never reconnects by itself)
//! ```
//!
//! Every socket attempt gets a fresh generation. Socket events and timers
//! carry the generation they belong to; anything older than the current one
//! is ignored, so a socket abandoned by `disconnect()` can never resurrect
//! the connection.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::backoff::Backoff;
use super::scheduler::ReconnectScheduler;
use crate::key::RoomKey;
use crate::protocol::{
    encode_update_frame, update_payload, AwarenessState, ClientId, ControlMessage, Outbound,
    ProtocolError,
};

/// Local replica shared between the driver (remote updates) and callers
/// (local transactions). Never hold it across an await.
pub type LocalDoc = Arc<Mutex<Doc>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
    Closed,
    Erroring,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("failed to connect to {url}: {reason}")]
    Open { url: String, reason: String },
    #[error("socket closed by server")]
    Closed,
    #[error("socket error: {0}")]
    Socket(String),
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open { url: String, generation: u64 },
    Send(Outbound),
    Close,
}

/// Snapshot of connection state for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionView {
    pub status: ConnectionStatus,
    pub synced: bool,
    pub error: Option<ConnectionError>,
    /// Consecutive failed attempts since the last successful open.
    pub attempt: u32,
    pub local_client_id: ClientId,
    pub local: Option<AwarenessState>,
    /// Remote awareness, ordered by client id.
    pub remote: Vec<(ClientId, AwarenessState)>,
}

impl ConnectionView {
    pub fn connected(&self) -> bool {
        self.status == ConnectionStatus::Open
    }

    pub fn users(&self, include_self: bool) -> Vec<AwarenessState> {
        let local = self.local.iter().filter(|_| include_self).cloned();
        local
            .chain(self.remote.iter().map(|(_, state)| state.clone()))
            .collect()
    }
}

pub struct ConnectionCore<S: ReconnectScheduler> {
    key: RoomKey,
    url: String,
    backoff: Backoff,
    scheduler: S,
    doc: LocalDoc,
    status: ConnectionStatus,
    attempt: u32,
    generation: u64,
    synced: bool,
    error: Option<ConnectionError>,
    local_client_id: ClientId,
    local: Option<AwarenessState>,
    remote: HashMap<ClientId, AwarenessState>,
}

/// `{base}/rooms/{roomId}/ws?type={roomType}`
pub fn room_url(base_url: &str, key: &RoomKey) -> String {
    format!(
        "{}/rooms/{}/ws?type={}",
        base_url.trim_end_matches('/'),
        key.room_id,
        key.room_type
    )
}

impl<S: ReconnectScheduler> ConnectionCore<S> {
    pub fn new(base_url: &str, key: RoomKey, backoff: Backoff, scheduler: S, doc: LocalDoc) -> Self {
        let local_client_id = {
            let doc = doc.lock().unwrap_or_else(PoisonError::into_inner);
            ClientId::Num(doc.client_id())
        };
        Self {
            url: room_url(base_url, &key),
            key,
            backoff,
            scheduler,
            doc,
            status: ConnectionStatus::Idle,
            attempt: 0,
            generation: 0,
            synced: false,
            error: None,
            local_client_id,
            local: None,
            remote: HashMap::new(),
        }
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn view(&self) -> ConnectionView {
        let mut remote: Vec<(ClientId, AwarenessState)> = self
            .remote
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        remote.sort_by(|a, b| a.0.cmp(&b.0));
        ConnectionView {
            status: self.status,
            synced: self.synced,
            error: self.error.clone(),
            attempt: self.attempt,
            local_client_id: self.local_client_id.clone(),
            local: self.local.clone(),
            remote,
        }
    }

    /// Start connecting unless already connecting or open. A pending
    /// reconnect timer is skipped.
    pub fn connect(&mut self) -> Vec<Command> {
        match self.status {
            ConnectionStatus::Connecting | ConnectionStatus::Open => Vec::new(),
            ConnectionStatus::Idle | ConnectionStatus::Closed | ConnectionStatus::Erroring => {
                self.scheduler.cancel();
                self.begin_attempt()
            }
        }
    }

    /// Stop for good: cancel any pending reconnect and close the socket.
    pub fn disconnect(&mut self) -> Vec<Command> {
        if self.status == ConnectionStatus::Closed {
            return Vec::new();
        }
        self.scheduler.cancel();
        self.generation += 1;
        self.status = ConnectionStatus::Closed;
        self.synced = false;
        self.attempt = 0;
        self.remote.clear();
        log::info!("Disconnected from room {}", self.key);
        vec![Command::Close]
    }

    pub fn on_open(&mut self, generation: u64) -> Vec<Command> {
        if generation != self.generation || self.status != ConnectionStatus::Connecting {
            log::debug!("Ignoring open of stale socket generation {generation}");
            return Vec::new();
        }
        self.status = ConnectionStatus::Open;
        self.attempt = 0;
        self.error = None;
        self.synced = false;

        // The whole local state, not just what was produced while offline: a
        // frame written to a socket that then died never reached the server.
        let state = {
            let doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        let mut commands = vec![Command::Send(Outbound::Binary(encode_update_frame(&state)))];
        if let Some(local) = &self.local {
            let msg = ControlMessage::awareness(self.local_client_id.clone(), Some(local.clone()));
            commands.extend(Outbound::control(&msg).map(Command::Send));
        }
        log::info!(
            "Connected to room {} (sent {} bytes of local state)",
            self.key,
            state.len()
        );
        commands
    }

    /// Merge a remote update. The first one after open is the server snapshot.
    pub fn on_binary(&mut self, generation: u64, frame: &[u8]) -> Result<(), ProtocolError> {
        if generation != self.generation {
            return Ok(());
        }
        let payload = update_payload(frame)?;
        let update =
            Update::decode_v1(payload).map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
        {
            let doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
        }
        if !self.synced {
            log::debug!("Room {} synced", self.key);
        }
        self.synced = true;
        Ok(())
    }

    pub fn on_text(&mut self, generation: u64, text: &str) -> Result<Vec<Command>, ProtocolError> {
        if generation != self.generation {
            return Ok(Vec::new());
        }
        match ControlMessage::parse(text)? {
            ControlMessage::Awareness { client_id, state } => {
                if client_id != self.local_client_id {
                    match state {
                        Some(state) => {
                            self.remote.insert(client_id, state);
                        }
                        None => {
                            self.remote.remove(&client_id);
                        }
                    }
                }
                Ok(Vec::new())
            }
            ControlMessage::Ping => Ok(Outbound::control(&ControlMessage::Pong)
                .map(Command::Send)
                .into_iter()
                .collect()),
            ControlMessage::Pong | ControlMessage::SyncRequest => Ok(Vec::new()),
        }
    }

    /// Unexpected close or error. Schedules the next attempt with backoff.
    pub fn on_failure(&mut self, generation: u64, error: ConnectionError) -> Vec<Command> {
        if generation != self.generation
            || !matches!(
                self.status,
                ConnectionStatus::Connecting | ConnectionStatus::Open
            )
        {
            return Vec::new();
        }
        let delay = self.backoff.delay(self.attempt);
        log::warn!(
            "Connection to room {} failed ({error}), retry {} in {delay:?}",
            self.key,
            self.attempt + 1
        );
        self.status = ConnectionStatus::Erroring;
        self.error = Some(error);
        self.synced = false;
        self.remote.clear();
        self.attempt = self.attempt.saturating_add(1);
        self.scheduler.schedule(delay, self.generation);
        vec![Command::Close]
    }

    pub fn on_reconnect_due(&mut self, generation: u64) -> Vec<Command> {
        if generation != self.generation || self.status != ConnectionStatus::Erroring {
            return Vec::new();
        }
        self.begin_attempt()
    }

    /// Send a yrs update already applied to the local doc. While not open it
    /// is dropped; the next open sends the full local state.
    pub fn send_update(&mut self, update: &[u8]) -> Vec<Command> {
        if self.status != ConnectionStatus::Open {
            log::trace!("Room {} not open, update deferred to next sync", self.key);
            return Vec::new();
        }
        vec![Command::Send(Outbound::Binary(encode_update_frame(update)))]
    }

    /// Replace (or with `None`, clear) the local awareness state.
    pub fn set_local_awareness(&mut self, state: Option<AwarenessState>) -> Vec<Command> {
        self.local = state.clone();
        if self.status != ConnectionStatus::Open {
            return Vec::new();
        }
        let msg = ControlMessage::awareness(self.local_client_id.clone(), state);
        Outbound::control(&msg).map(Command::Send).into_iter().collect()
    }

    fn begin_attempt(&mut self) -> Vec<Command> {
        self.generation += 1;
        self.status = ConnectionStatus::Connecting;
        log::debug!("Connecting to {} (generation {})", self.url, self.generation);
        vec![Command::Open {
            url: self.url.clone(),
            generation: self.generation,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::scheduler::ManualScheduler;
    use crate::protocol::CursorPosition;
    use std::time::Duration;
    use yrs::{GetString, Text};

    fn core() -> ConnectionCore<ManualScheduler> {
        ConnectionCore::new(
            "ws://localhost:9090/",
            RoomKey::parse("text", "r1").unwrap(),
            Backoff::new(Duration::from_millis(500), Duration::from_secs(30)),
            ManualScheduler::new(),
            Arc::new(Mutex::new(Doc::with_client_id(77))),
        )
    }

    fn opened() -> ConnectionCore<ManualScheduler> {
        let mut core = core();
        core.connect();
        core.on_open(core.generation());
        core
    }

    fn remote_frame(text: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(5);
        let shared = doc.get_or_insert_text("body");
        shared.insert(&mut doc.transact_mut(), 0, text);
        let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
        encode_update_frame(&update).to_vec()
    }

    #[test]
    fn test_room_url() {
        let key = RoomKey::parse("flow", "abc").unwrap();
        assert_eq!(room_url("ws://h:1/", &key), "ws://h:1/rooms/abc/ws?type=flow");
    }

    #[test]
    fn test_connect_is_noop_while_connecting_or_open() {
        let mut core = core();
        let first = core.connect();
        assert_eq!(
            first,
            vec![Command::Open {
                url: "ws://localhost:9090/rooms/r1/ws?type=text".into(),
                generation: 1
            }]
        );
        assert!(core.connect().is_empty());
        core.on_open(1);
        assert_eq!(core.status(), ConnectionStatus::Open);
        assert!(core.connect().is_empty());
    }

    /// Apply a local edit to the replica and return its update.
    fn local_edit(core: &ConnectionCore<ManualScheduler>, text: &str) -> Vec<u8> {
        let doc = core.doc.lock().unwrap();
        let shared = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        let at = shared.len(&txn);
        shared.insert(&mut txn, at, text);
        txn.encode_update_v1()
    }

    fn text_in(command: &Command) -> String {
        let Command::Send(Outbound::Binary(frame)) = command else {
            panic!("expected a binary frame, got {command:?}");
        };
        let doc = Doc::new();
        let shared = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(update_payload(frame).unwrap()).unwrap())
            .unwrap();
        shared.get_string(&txn)
    }

    #[test]
    fn test_open_resets_flags_and_sends_local_state() {
        let mut core = core();
        let update = local_edit(&core, "offline");
        assert!(core.send_update(&update).is_empty());

        core.connect();
        let commands = core.on_open(core.generation());
        assert_eq!(commands.len(), 1);
        assert_eq!(text_in(&commands[0]), "offline");
        let view = core.view();
        assert!(view.connected());
        assert!(!view.synced);
        assert!(view.error.is_none());
    }

    #[test]
    fn test_update_lost_in_flight_is_resent_after_reconnect() {
        let mut core = opened();
        let update = local_edit(&core, "typed");
        let sent = core.send_update(&update);
        assert_eq!(sent.len(), 1);

        // The socket dies before the frame reaches the server.
        let gen = core.generation();
        assert_eq!(core.on_failure(gen, ConnectionError::Closed), vec![Command::Close]);
        let fired = core.scheduler_mut().advance(Duration::from_millis(500)).unwrap();
        assert!(matches!(core.on_reconnect_due(fired)[0], Command::Open { .. }));

        let commands = core.on_open(core.generation());
        assert_eq!(text_in(&commands[0]), "typed");
    }

    #[test]
    fn test_first_binary_marks_synced_and_merges() {
        let mut core = opened();
        let gen = core.generation();
        core.on_binary(gen, &remote_frame("remote")).unwrap();
        assert!(core.view().synced);

        let doc = core.doc.lock().unwrap();
        let text = doc.get_or_insert_text("body");
        assert_eq!(text.get_string(&doc.transact()), "remote");
    }

    #[test]
    fn test_invalid_binary_is_rejected() {
        let mut core = opened();
        let gen = core.generation();
        assert!(core.on_binary(gen, &[0]).is_err());
        assert!(!core.view().synced);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut core = core();
        let mut fired_after = Vec::new();
        core.connect();
        for _ in 0..8 {
            let gen = core.generation();
            assert_eq!(core.on_failure(gen, ConnectionError::Closed), vec![Command::Close]);
            assert_eq!(core.status(), ConnectionStatus::Erroring);

            let due = core.scheduler().due_at().unwrap() - core.scheduler().now();
            fired_after.push(due.as_millis() as u64);
            assert_eq!(core.scheduler_mut().advance(due - Duration::from_millis(1)), None);
            let fired = core.scheduler_mut().advance(Duration::from_millis(1)).unwrap();
            let commands = core.on_reconnect_due(fired);
            assert!(matches!(commands[0], Command::Open { .. }));
            assert_eq!(core.status(), ConnectionStatus::Connecting);
        }
        assert_eq!(
            fired_after,
            vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]
        );

        core.on_open(core.generation());
        assert_eq!(core.attempt(), 0);
    }

    #[test]
    fn test_disconnect_cancels_timer_and_ignores_stale_socket() {
        let mut core = opened();
        let stale = core.generation();
        core.on_failure(stale, ConnectionError::Socket("reset".into()));
        assert!(core.scheduler().is_pending());

        assert_eq!(core.disconnect(), vec![Command::Close]);
        assert!(core.disconnect().is_empty());
        assert!(!core.scheduler().is_pending());

        assert!(core.on_reconnect_due(stale).is_empty());
        assert!(core.on_open(stale).is_empty());
        assert!(core.on_failure(stale, ConnectionError::Closed).is_empty());
        core.on_binary(stale, &remote_frame("late")).unwrap();
        assert_eq!(core.status(), ConnectionStatus::Closed);
        assert!(!core.view().synced);
    }

    #[test]
    fn test_awareness_table_tracks_remote_clients() {
        let mut core = opened();
        let gen = core.generation();
        core.on_text(
            gen,
            r#"{"type":"awareness","clientId":9,"state":{"cursor":{"x":1.0,"y":2.0}}}"#,
        )
        .unwrap();
        core.on_text(gen, r#"{"type":"awareness","clientId":77,"state":{}}"#)
            .unwrap();

        let view = core.view();
        assert_eq!(view.remote.len(), 1);
        assert_eq!(
            view.remote[0].1.cursor,
            Some(CursorPosition { x: 1.0, y: 2.0 })
        );

        core.on_text(gen, r#"{"type":"awareness","clientId":9,"state":null}"#)
            .unwrap();
        assert!(core.view().remote.is_empty());
    }

    #[test]
    fn test_ping_is_answered() {
        let mut core = opened();
        let gen = core.generation();
        assert_eq!(
            core.on_text(gen, r#"{"type":"ping"}"#).unwrap(),
            vec![Command::Send(Outbound::text(r#"{"type":"pong"}"#))]
        );
        assert!(core.on_text(gen, "garbage").is_err());
    }

    #[test]
    fn test_local_awareness_resent_on_open() {
        let mut core = core();
        let state = AwarenessState {
            cursor: Some(CursorPosition { x: 3.0, y: 4.0 }),
            ..AwarenessState::default()
        };
        assert!(core.set_local_awareness(Some(state.clone())).is_empty());

        core.connect();
        let commands = core.on_open(core.generation());
        assert_eq!(commands.len(), 2);
        assert!(matches!(&commands[1], Command::Send(Outbound::Text(_))));
        let view = core.view();
        assert_eq!(view.users(true), vec![state]);
        assert!(view.users(false).is_empty());
    }
}
