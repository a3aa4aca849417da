//! Typed views over shared structures of a connected document.
//!
//! ```text
//!  remote update ─► Connection ─► LocalDoc ─┐
//!                                           ├─► deep observer ─► watch<JSON snapshot>
//!  set()/push() ─► Connection::transact ────┘                         │
//!                         │                                           ▼
//!                         └─► update frame ─► server          UI subscribers
//! ```
//!
//! Map and array views publish a flattened JSON snapshot after every
//! transaction that touched them, whoever made it. Text and XML fragment views
//! hand out the raw yrs refs for editor bindings plus a revision counter.

use std::sync::{Arc, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use yrs::types::ToJson;
use yrs::{
    Any, Array, ArrayRef, DeepObservable, GetString, Map, MapRef, Subscription, Text, TextRef,
    Transact, XmlFragmentRef,
};

use crate::client::{Connection, ConnectionError};
use crate::protocol::AwarenessState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: u32, len: u32 },
    #[error("value cannot be stored: {0}")]
    Json(String),
}

/// `Number` stays a JSON float even when it has no fractional part; only
/// `BigInt` becomes a JSON integer.
fn to_value(any: Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(b),
        Any::Number(n) => Value::from(n),
        Any::BigInt(n) => Value::from(n),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|&b| Value::from(b)).collect()),
        Any::Array(items) => Value::Array(items.iter().cloned().map(to_value).collect()),
        Any::Map(entries) => Value::Object(to_entries(&entries)),
    }
}

fn to_entries(entries: &std::collections::HashMap<String, Any>) -> serde_json::Map<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.clone(), to_value(v.clone())))
        .collect()
}

fn to_any(value: &Value) -> Result<Any, AdapterError> {
    serde_json::from_value(value.clone()).map_err(|e| AdapterError::Json(e.to_string()))
}

fn to_object(any: Any) -> serde_json::Map<String, Value> {
    match any {
        Any::Map(entries) => to_entries(&entries),
        _ => serde_json::Map::new(),
    }
}

fn to_array(any: Any) -> Vec<Value> {
    match any {
        Any::Array(items) => items.iter().cloned().map(to_value).collect(),
        _ => Vec::new(),
    }
}

/// Entry point: typed views bound to one connection.
pub struct SyncAdapter {
    connection: Arc<Connection>,
}

impl SyncAdapter {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn map(&self, name: &str) -> SyncedMap {
        SyncedMap::new(self.connection.clone(), name)
    }

    pub fn array(&self, name: &str) -> SyncedArray {
        SyncedArray::new(self.connection.clone(), name)
    }

    pub fn text(&self, name: &str) -> SyncedText {
        SyncedText::new(self.connection.clone(), name)
    }

    pub fn fragment(&self, name: &str) -> SyncedFragment {
        SyncedFragment::new(self.connection.clone(), name)
    }

    pub fn connected(&self) -> bool {
        self.connection.connected()
    }

    pub fn synced(&self) -> bool {
        self.connection.synced()
    }

    pub fn error(&self) -> Option<ConnectionError> {
        self.connection.error()
    }

    /// Users in the room; the local one only if the connection is configured
    /// to include it.
    pub fn users(&self) -> Vec<AwarenessState> {
        self.connection.users()
    }

    pub fn users_with_self(&self, include_self: bool) -> Vec<AwarenessState> {
        self.connection.view().users(include_self)
    }
}

// ───────────────────────────────────────────────────────────────────
// Map
// ───────────────────────────────────────────────────────────────────

pub struct SyncedMap {
    connection: Arc<Connection>,
    map: MapRef,
    snapshot: watch::Receiver<serde_json::Map<String, Value>>,
    _subscription: Subscription,
}

impl SyncedMap {
    fn new(connection: Arc<Connection>, name: &str) -> Self {
        let (map, initial) = {
            let doc = connection.doc().lock().unwrap_or_else(PoisonError::into_inner);
            let map = doc.get_or_insert_map(name);
            let initial = to_object(map.to_json(&doc.transact()));
            (map, initial)
        };
        let (tx, rx) = watch::channel(initial);
        let observed = map.clone();
        let subscription = map.observe_deep(move |txn, _events| {
            tx.send_replace(to_object(observed.to_json(txn)));
        });
        Self {
            connection,
            map,
            snapshot: rx,
            _subscription: subscription,
        }
    }

    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.snapshot.borrow().clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.snapshot.borrow().get(key).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<serde_json::Map<String, Value>> {
        self.snapshot.clone()
    }

    pub fn set(&self, key: &str, value: impl Into<Any>) {
        let value = value.into();
        self.connection.transact(|txn| {
            self.map.insert(txn, key, value);
        });
    }

    pub fn set_json(&self, key: &str, value: &Value) -> Result<(), AdapterError> {
        let any = to_any(value)?;
        self.set(key, any);
        Ok(())
    }

    /// Returns whether the key existed.
    pub fn remove(&self, key: &str) -> bool {
        self.connection
            .transact(|txn| self.map.remove(txn, key))
            .is_some()
    }

    pub fn raw(&self) -> &MapRef {
        &self.map
    }
}

// ───────────────────────────────────────────────────────────────────
// Array
// ───────────────────────────────────────────────────────────────────

pub struct SyncedArray {
    connection: Arc<Connection>,
    array: ArrayRef,
    snapshot: watch::Receiver<Vec<Value>>,
    _subscription: Subscription,
}

impl SyncedArray {
    fn new(connection: Arc<Connection>, name: &str) -> Self {
        let (array, initial) = {
            let doc = connection.doc().lock().unwrap_or_else(PoisonError::into_inner);
            let array = doc.get_or_insert_array(name);
            let initial = to_array(array.to_json(&doc.transact()));
            (array, initial)
        };
        let (tx, rx) = watch::channel(initial);
        let observed = array.clone();
        let subscription = array.observe_deep(move |txn, _events| {
            tx.send_replace(to_array(observed.to_json(txn)));
        });
        Self {
            connection,
            array,
            snapshot: rx,
            _subscription: subscription,
        }
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.snapshot.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.snapshot.borrow().get(index).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Value>> {
        self.snapshot.clone()
    }

    pub fn push(&self, value: impl Into<Any>) {
        let value = value.into();
        self.connection.transact(|txn| {
            self.array.push_back(txn, value);
        });
    }

    pub fn push_json(&self, value: &Value) -> Result<(), AdapterError> {
        let any = to_any(value)?;
        self.push(any);
        Ok(())
    }

    pub fn insert(&self, index: u32, value: impl Into<Any>) -> Result<(), AdapterError> {
        let value = value.into();
        self.connection.transact(|txn| {
            let len = self.array.len(&*txn);
            if index > len {
                return Err(AdapterError::IndexOutOfBounds { index, len });
            }
            self.array.insert(txn, index, value);
            Ok(())
        })
    }

    /// Remove `count` items starting at `index`.
    pub fn delete(&self, index: u32, count: u32) -> Result<(), AdapterError> {
        self.connection.transact(|txn| {
            let len = self.array.len(&*txn);
            if index.checked_add(count).is_none_or(|end| end > len) {
                return Err(AdapterError::IndexOutOfBounds { index, len });
            }
            self.array.remove_range(txn, index, count);
            Ok(())
        })
    }

    pub fn raw(&self) -> &ArrayRef {
        &self.array
    }
}

// ───────────────────────────────────────────────────────────────────
// Text & XML fragment (editor embedding)
// ───────────────────────────────────────────────────────────────────

/// Observe any shared ref and count the transactions that touched it.
fn revision_counter<T: DeepObservable>(shared: &T) -> (watch::Receiver<u64>, Subscription) {
    let (tx, rx) = watch::channel(0u64);
    let subscription = shared.observe_deep(move |_txn, _events| {
        tx.send_modify(|revision| *revision += 1);
    });
    (rx, subscription)
}

pub struct SyncedText {
    connection: Arc<Connection>,
    text: TextRef,
    revision: watch::Receiver<u64>,
    _subscription: Subscription,
}

impl SyncedText {
    fn new(connection: Arc<Connection>, name: &str) -> Self {
        let text = connection
            .doc()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_text(name);
        let (revision, subscription) = revision_counter(&text);
        Self {
            connection,
            text,
            revision,
            _subscription: subscription,
        }
    }

    /// Shared text for editor bindings. Mutate it through
    /// [`Connection::transact`] so changes are sent.
    pub fn raw(&self) -> &TextRef {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.clone()
    }

    pub fn content(&self) -> String {
        let doc = self.connection.doc().lock().unwrap_or_else(PoisonError::into_inner);
        let txn = doc.transact();
        self.text.get_string(&txn)
    }

    pub fn insert(&self, index: u32, chunk: &str) {
        self.connection.transact(|txn| self.text.insert(txn, index, chunk));
    }

    pub fn delete(&self, index: u32, len: u32) {
        self.connection.transact(|txn| self.text.remove_range(txn, index, len));
    }
}

pub struct SyncedFragment {
    connection: Arc<Connection>,
    fragment: XmlFragmentRef,
    revision: watch::Receiver<u64>,
    _subscription: Subscription,
}

impl SyncedFragment {
    fn new(connection: Arc<Connection>, name: &str) -> Self {
        let fragment = connection
            .doc()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_xml_fragment(name);
        let (revision, subscription) = revision_counter(&fragment);
        Self {
            connection,
            fragment,
            revision,
            _subscription: subscription,
        }
    }

    pub fn raw(&self) -> &XmlFragmentRef {
        &self.fragment
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.clone()
    }

    pub fn to_xml(&self) -> String {
        let doc = self.connection.doc().lock().unwrap_or_else(PoisonError::into_inner);
        let txn = doc.transact();
        self.fragment.get_string(&txn)
    }

    /// Run an editor-side mutation on the fragment and send it.
    pub fn edit<R>(&self, f: impl FnOnce(&XmlFragmentRef, &mut yrs::TransactionMut) -> R) -> R {
        self.connection.transact(|txn| f(&self.fragment, txn))
    }
}
