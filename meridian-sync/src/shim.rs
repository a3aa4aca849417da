//! Awareness facade for third-party collaborative-cursor extensions.
//!
//! Editor extensions expect a provider shaped like
//! `provider.awareness.setLocalStateField(..)`. [`CollaborationProvider`]
//! offers that surface and forwards everything to the [`PresenceManager`];
//! no message type is added to the protocol.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::presence::PresenceManager;
use crate::protocol::{AwarenessState, ClientId};

pub struct CollaborationProvider {
    pub awareness: EditorAwareness,
}

impl CollaborationProvider {
    pub fn new(presence: Arc<Mutex<PresenceManager>>) -> Self {
        Self {
            awareness: EditorAwareness::new(presence),
        }
    }
}

pub struct EditorAwareness {
    presence: Arc<Mutex<PresenceManager>>,
    withdrawn: AtomicBool,
}

impl EditorAwareness {
    pub fn new(presence: Arc<Mutex<PresenceManager>>) -> Self {
        Self {
            presence,
            withdrawn: AtomicBool::new(false),
        }
    }

    fn presence(&self) -> MutexGuard<'_, PresenceManager> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_id(&self) -> ClientId {
        self.presence().local_client_id()
    }

    /// `setLocalStateField(field, value)`.
    pub fn set_local_state_field(&self, field: &str, value: Value) -> Result<(), serde_json::Error> {
        self.presence().set_field(field, value)?;
        self.withdrawn.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// `setLocalState(state)`; `None` withdraws the local state. A state
    /// without `user` keeps the current one.
    pub fn set_local_state(&self, state: Option<Value>) -> Result<(), serde_json::Error> {
        let mut presence = self.presence();
        match state {
            Some(value) => {
                presence.replace_local(serde_json::from_value(value)?);
                self.withdrawn.store(false, Ordering::Relaxed);
            }
            None => {
                presence.clear();
                self.withdrawn.store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn get_local_state(&self) -> Option<AwarenessState> {
        if self.withdrawn.load(Ordering::Relaxed) {
            return None;
        }
        Some(self.presence().local_state().clone())
    }

    /// Every known state keyed by client id, the local one included.
    pub fn get_states(&self) -> BTreeMap<ClientId, AwarenessState> {
        let presence = self.presence();
        let mut states: BTreeMap<_, _> = presence.remote_states().into_iter().collect();
        if !self.withdrawn.load(Ordering::Relaxed) {
            states.insert(presence.local_client_id(), presence.local_state().clone());
        }
        states
    }
}
