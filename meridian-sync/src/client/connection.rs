//! Tokio driver for [`ConnectionCore`].
//!
//! One task per connection owns the state machine and processes every event
//! serially: consumer calls, socket events and reconnect timers. State is
//! published through a `watch` channel so reads never block the driver.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use yrs::{Doc, TransactionMut, Transact};

use super::backoff::Backoff;
use super::machine::{
    Command, ConnectionCore, ConnectionError, ConnectionStatus, ConnectionView, LocalDoc,
};
use super::scheduler::TokioScheduler;
use crate::config::ClientConfig;
use crate::key::RoomKey;
use crate::protocol::{AwarenessState, ClientId, Outbound};

/// A v1 update with no structs and an empty delete set.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

enum DriverEvent {
    Connect,
    Disconnect,
    LocalUpdate(Vec<u8>),
    Awareness(Option<AwarenessState>),
    Socket { generation: u64, event: SocketEvent },
    Shutdown,
}

enum SocketEvent {
    Opened(mpsc::UnboundedSender<Message>),
    Binary(Bytes),
    Text(String),
    Failed(ConnectionError),
}

/// Handle to one room connection. Dropping it shuts the driver down.
pub struct Connection {
    key: RoomKey,
    doc: LocalDoc,
    client_id: ClientId,
    events: mpsc::UnboundedSender<DriverEvent>,
    view: watch::Receiver<ConnectionView>,
    exclude_self: bool,
    driver: JoinHandle<()>,
}

impl Connection {
    /// Spawn the driver for `(room_type, room_id)`. Starts idle; call
    /// [`Connection::connect`].
    pub fn new(config: &ClientConfig, key: RoomKey) -> Self {
        Self::with_doc(config, key, Doc::new())
    }

    /// Like [`Connection::new`] with a caller-provided replica (e.g. a fixed
    /// client id).
    pub fn with_doc(config: &ClientConfig, key: RoomKey, doc: Doc) -> Self {
        let client_id = ClientId::Num(doc.client_id());
        let doc: LocalDoc = Arc::new(Mutex::new(doc));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();

        let core = ConnectionCore::new(
            &config.base_url,
            key.clone(),
            Backoff::new(config.backoff_base(), config.backoff_cap()),
            TokioScheduler::new(due_tx),
            doc.clone(),
        );
        let (view_tx, view_rx) = watch::channel(core.view());
        let driver = Driver {
            core,
            events_tx: events_tx.clone(),
            view: view_tx,
            socket: None,
        };
        let handle = tokio::spawn(driver.run(events_rx, due_rx));

        Self {
            key,
            doc,
            client_id,
            events: events_tx,
            view: view_rx,
            exclude_self: config.exclude_self_from_users,
            driver: handle,
        }
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn doc(&self) -> &LocalDoc {
        &self.doc
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn connect(&self) {
        let _ = self.events.send(DriverEvent::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.events.send(DriverEvent::Disconnect);
    }

    /// Send an already encoded yrs v1 update. Queued while not open.
    pub fn send(&self, update: Vec<u8>) {
        let _ = self.events.send(DriverEvent::LocalUpdate(update));
    }

    /// Replace the local awareness state (`None` removes it).
    pub fn send_awareness(&self, state: Option<AwarenessState>) {
        let _ = self.events.send(DriverEvent::Awareness(state));
    }

    /// Run a local transaction and send what it changed.
    pub fn transact<R>(&self, f: impl FnOnce(&mut TransactionMut) -> R) -> R {
        let (result, update) = {
            let doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
            let mut txn = doc.transact_mut();
            let result = f(&mut txn);
            let update = txn.encode_update_v1();
            (result, update)
        };
        if update.as_slice() != EMPTY_UPDATE {
            self.send(update);
        }
        result
    }

    pub fn view(&self) -> ConnectionView {
        self.view.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.view.borrow().status
    }

    pub fn connected(&self) -> bool {
        self.view.borrow().connected()
    }

    pub fn synced(&self) -> bool {
        self.view.borrow().synced
    }

    pub fn error(&self) -> Option<ConnectionError> {
        self.view.borrow().error.clone()
    }

    /// Awareness states in the room, honouring `exclude_self_from_users`.
    pub fn users(&self) -> Vec<AwarenessState> {
        self.view.borrow().users(!self.exclude_self)
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionView> {
        self.view.clone()
    }

    /// Wait until `predicate` holds. Returns `false` on timeout.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&ConnectionView) -> bool,
    ) -> bool {
        let mut view = self.view.clone();
        tokio::time::timeout(timeout, view.wait_for(predicate))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.events.send(DriverEvent::Shutdown);
        if self.events.is_closed() {
            self.driver.abort();
        }
    }
}

struct SocketHandle {
    generation: u64,
    tx: Option<mpsc::UnboundedSender<Message>>,
}

struct Driver {
    core: ConnectionCore<TokioScheduler>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    view: watch::Sender<ConnectionView>,
    socket: Option<SocketHandle>,
}

impl Driver {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<DriverEvent>,
        mut due: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            let commands = tokio::select! {
                event = events.recv() => match event {
                    Some(DriverEvent::Shutdown) | None => {
                        let commands = self.core.disconnect();
                        self.execute(commands);
                        break;
                    }
                    Some(event) => self.handle(event),
                },
                Some(generation) = due.recv() => self.core.on_reconnect_due(generation),
            };
            self.execute(commands);
            self.publish();
        }
        self.publish();
    }

    fn handle(&mut self, event: DriverEvent) -> Vec<Command> {
        match event {
            DriverEvent::Connect => self.core.connect(),
            DriverEvent::Disconnect => self.core.disconnect(),
            DriverEvent::LocalUpdate(update) => self.core.send_update(&update),
            DriverEvent::Awareness(state) => self.core.set_local_awareness(state),
            DriverEvent::Socket { generation, event } => match event {
                SocketEvent::Opened(tx) => {
                    match &mut self.socket {
                        Some(socket) if socket.generation == generation => socket.tx = Some(tx),
                        _ => return Vec::new(),
                    }
                    self.core.on_open(generation)
                }
                SocketEvent::Binary(frame) => {
                    if let Err(e) = self.core.on_binary(generation, &frame) {
                        log::warn!("Dropped update for room {}: {e}", self.core.key());
                    }
                    Vec::new()
                }
                SocketEvent::Text(text) => match self.core.on_text(generation, &text) {
                    Ok(commands) => commands,
                    Err(e) => {
                        log::warn!("Dropped control message for room {}: {e}", self.core.key());
                        Vec::new()
                    }
                },
                SocketEvent::Failed(error) => self.core.on_failure(generation, error),
            },
            DriverEvent::Shutdown => Vec::new(),
        }
    }

    fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Open { url, generation } => {
                    self.socket = Some(SocketHandle {
                        generation,
                        tx: None,
                    });
                    tokio::spawn(run_socket(url, generation, self.events_tx.clone()));
                }
                Command::Send(frame) => {
                    let message = match frame {
                        Outbound::Binary(bytes) => Message::Binary(bytes),
                        Outbound::Text(text) => Message::Text(text.to_string().into()),
                    };
                    let sent = self
                        .socket
                        .as_ref()
                        .and_then(|s| s.tx.as_ref())
                        .is_some_and(|tx| tx.send(message).is_ok());
                    if !sent {
                        log::debug!("No open socket for room {}, frame dropped", self.core.key());
                    }
                }
                // Dropping the sender makes the socket task close the stream.
                Command::Close => self.socket = None,
            }
        }
    }

    fn publish(&self) {
        let view = self.core.view();
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

/// Owns one WebSocket until it fails or the driver drops its sender.
async fn run_socket(url: String, generation: u64, events: mpsc::UnboundedSender<DriverEvent>) {
    let report = |event: SocketEvent| {
        let _ = events.send(DriverEvent::Socket { generation, event });
    };

    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            report(SocketEvent::Failed(ConnectionError::Open {
                url,
                reason: e.to_string(),
            }));
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    report(SocketEvent::Opened(tx));
    let (mut sink, mut stream) = stream.split();

    let failure = loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        break ConnectionError::Socket(e.to_string());
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => report(SocketEvent::Binary(bytes)),
                Some(Ok(Message::Text(text))) => report(SocketEvent::Text(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) | None => break ConnectionError::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => break ConnectionError::Socket(e.to_string()),
            },
        }
    };
    report(SocketEvent::Failed(failure));
}
