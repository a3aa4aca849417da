//! Presence: who is here, where their cursor is, what they selected.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move / selection / node pick
//!       │
//!       ▼
//! PresenceManager::update_*()      (changes only local fields)
//!       │
//!       ▼  whole local AwarenessState
//! AwarenessTransport::publish()    (Connection ─► {"type":"awareness",...})
//!       │
//!       ▼   (WebSocket broadcast)
//! Remote awareness tables ─► other_users() / get_node_presence_style()
//! ```
//!
//! Awareness states are replaced wholesale on every publish, so the manager
//! always sends its complete local state, never a diff.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::client::Connection;
use crate::protocol::{
    AwarenessState, AwarenessUser, ClientId, CursorPosition, GhostNode, SelectionRange,
};

// ───────────────────────────────────────────────────────────────────
// Capabilities
// ───────────────────────────────────────────────────────────────────

/// Where awareness goes and where the other clients' states come from.
pub trait AwarenessTransport: Send + Sync {
    fn local_client_id(&self) -> ClientId;

    /// Replace the local state for everyone (`None` removes it).
    fn publish(&self, state: Option<AwarenessState>);

    /// States of the other clients.
    fn remote_states(&self) -> Vec<(ClientId, AwarenessState)>;
}

impl AwarenessTransport for Connection {
    fn local_client_id(&self) -> ClientId {
        self.client_id().clone()
    }

    fn publish(&self, state: Option<AwarenessState>) {
        self.send_awareness(state);
    }

    fn remote_states(&self) -> Vec<(ClientId, AwarenessState)> {
        self.view().remote
    }
}

/// Supplies the identity of the local user.
pub trait CurrentUserProvider: Send + Sync {
    fn current_user(&self) -> Option<AwarenessUser>;
}

/// A fixed, known user.
pub struct StaticUser(pub AwarenessUser);

impl CurrentUserProvider for StaticUser {
    fn current_user(&self) -> Option<AwarenessUser> {
        Some(self.0.clone())
    }
}

/// Fallback when nobody is signed in: a random id, stable for the process.
pub struct AnonymousUser {
    id: String,
}

impl AnonymousUser {
    pub fn new() -> Self {
        Self {
            id: format!("anonymous-{}", Uuid::new_v4().simple()),
        }
    }

    pub fn user(&self) -> AwarenessUser {
        AwarenessUser {
            id: self.id.clone(),
            name: "Anonymous".to_string(),
            color: user_color(&self.id),
        }
    }
}

impl Default for AnonymousUser {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentUserProvider for AnonymousUser {
    fn current_user(&self) -> Option<AwarenessUser> {
        Some(self.user())
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable, visually distinct CSS color (`#rrggbb`) for a user id.
///
/// FNV-1a of the id picks the hue; saturation and lightness are fixed so
/// every user gets an equally vivid color.
pub fn user_color(user_id: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Presence manager
// ───────────────────────────────────────────────────────────────────

/// Decoration for a node other users have selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePresenceStyle {
    pub border_color: String,
    pub box_shadow: String,
    /// First selecting user's name, plus `+N` for the rest.
    pub label: String,
    pub user_count: usize,
}

pub struct PresenceManager {
    transport: Arc<dyn AwarenessTransport>,
    local: AwarenessState,
}

impl PresenceManager {
    /// Start with the provider's user, or an anonymous one.
    pub fn new(
        transport: Arc<dyn AwarenessTransport>,
        provider: Option<&dyn CurrentUserProvider>,
    ) -> Self {
        let user = provider
            .and_then(|p| p.current_user())
            .unwrap_or_else(|| AnonymousUser::new().user());
        let manager = Self {
            transport,
            local: AwarenessState::for_user(user),
        };
        manager.publish();
        manager
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    pub fn local_user(&self) -> Option<&AwarenessUser> {
        self.local.user.as_ref()
    }

    pub fn update_cursor(&mut self, cursor: Option<CursorPosition>) {
        self.local.cursor = cursor;
        self.publish();
    }

    pub fn update_selection(&mut self, selection: Option<SelectionRange>) {
        self.local.selection = selection;
        self.publish();
    }

    pub fn select_node(&mut self, node_id: Option<String>) {
        self.local.selected_node_id = node_id;
        self.publish();
    }

    pub fn update_ghost_node(&mut self, ghost: Option<GhostNode>) {
        self.local.ghost_node = ghost;
        self.publish();
    }

    pub fn set_user(&mut self, user: AwarenessUser) {
        self.local.user = Some(user);
        self.publish();
    }

    /// Set (or with `Null`, clear) an extension field.
    pub fn set_extra(&mut self, field: impl Into<String>, value: serde_json::Value) {
        let field = field.into();
        if value.is_null() {
            self.local.extra.remove(&field);
        } else {
            self.local.extra.insert(field, value);
        }
        self.publish();
    }

    /// Replace the whole local state. The user block is kept when the new
    /// state carries none.
    pub fn replace_local(&mut self, mut state: AwarenessState) {
        if state.user.is_none() {
            state.user = self.local.user.take();
        }
        self.local = state;
        self.publish();
    }

    /// Set one field of the local state by its wire name (`cursor`,
    /// `selectedNodeId`, an extension key, ...). `Null` clears it.
    pub fn set_field(&mut self, field: &str, value: serde_json::Value) -> Result<(), serde_json::Error> {
        let mut object = match serde_json::to_value(&self.local)? {
            serde_json::Value::Object(object) => object,
            _ => serde_json::Map::new(),
        };
        if value.is_null() {
            object.remove(field);
        } else {
            object.insert(field.to_string(), value);
        }
        self.local = serde_json::from_value(serde_json::Value::Object(object))?;
        self.publish();
        Ok(())
    }

    /// Withdraw the local state from the room.
    pub fn clear(&self) {
        self.transport.publish(None);
    }

    pub fn local_client_id(&self) -> ClientId {
        self.transport.local_client_id()
    }

    pub fn remote_states(&self) -> Vec<(ClientId, AwarenessState)> {
        self.transport.remote_states()
    }

    /// Everyone else in the room.
    pub fn other_users(&self) -> Vec<AwarenessState> {
        self.transport
            .remote_states()
            .into_iter()
            .map(|(_, state)| state)
            .collect()
    }

    /// Other users whose selection is `node_id`, in client id order.
    pub fn get_users_selecting_node(&self, node_id: &str) -> Vec<AwarenessUser> {
        self.transport
            .remote_states()
            .into_iter()
            .filter(|(_, state)| state.selected_node_id.as_deref() == Some(node_id))
            .filter_map(|(_, state)| state.user)
            .collect()
    }

    pub fn get_user_color(&self, user_id: &str) -> String {
        user_color(user_id)
    }

    /// `None` when no other user has the node selected.
    pub fn get_node_presence_style(&self, node_id: &str) -> Option<NodePresenceStyle> {
        let users = self.get_users_selecting_node(node_id);
        let first = users.first()?;
        let label = match users.len() {
            1 => first.name.clone(),
            n => format!("{} +{}", first.name, n - 1),
        };
        Some(NodePresenceStyle {
            border_color: first.color.clone(),
            box_shadow: format!("0 0 0 2px {}", first.color),
            label,
            user_count: users.len(),
        })
    }

    fn publish(&self) {
        self.transport.publish(Some(self.local.clone()));
    }
}
