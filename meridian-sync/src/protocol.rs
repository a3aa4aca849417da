//! Wire protocol multiplexed over one WebSocket per peer.
//!
//! ```text
//! Binary frame (document update or snapshot):
//! ┌──────────┬──────────────────────────────┐
//! │ marker   │ yrs update (lib0 v1)         │
//! │ 1 byte=0 │ ≥ 1 byte                     │
//! └──────────┴──────────────────────────────┘
//!
//! Text frame (JSON control message):
//!   {"type":"awareness","clientId":42,"state":{...}|null}
//!   {"type":"sync-request"}
//!   {"type":"ping"} / {"type":"pong"}
//! ```
//!
//! A binary frame shorter than two bytes or with a marker other than `0` is a
//! [`ProtocolError`]: it is dropped before it reaches any document.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Encoding version marker carried in the first byte of every binary frame.
pub const UPDATE_MARKER: u8 = 0;

/// Marker plus at least one payload byte.
pub const MIN_UPDATE_FRAME_LEN: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("binary frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("unknown binary marker {0:#04x}")]
    UnknownMarker(u8),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid update payload: {0}")]
    InvalidUpdate(String),
    #[error("invalid control message: {0}")]
    InvalidJson(String),
}

/// Validate a binary frame and return the update payload behind the marker.
pub fn update_payload(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    if frame.len() < MIN_UPDATE_FRAME_LEN {
        return Err(ProtocolError::FrameTooShort(frame.len()));
    }
    if frame[0] != UPDATE_MARKER {
        return Err(ProtocolError::UnknownMarker(frame[0]));
    }
    Ok(&frame[1..])
}

/// Prefix a yrs update with the version marker.
pub fn encode_update_frame(update: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(update.len() + 1);
    frame.push(UPDATE_MARKER);
    frame.extend_from_slice(update);
    Bytes::from(frame)
}

/// Awareness client identifier.
///
/// Editors usually send the numeric CRDT client id; string ids are accepted
/// so non-editor consumers can participate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientId {
    Num(u64),
    Str(String),
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientId::Num(n) => write!(f, "{n}"),
            ClientId::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for ClientId {
    fn from(value: u64) -> Self {
        ClientId::Num(value)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        ClientId::Str(value.to_string())
    }
}

/// Identity block carried inside every awareness state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUser {
    pub id: String,
    pub name: String,
    /// CSS hex color, e.g. `#3b82f6`.
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: u64,
    pub head: u64,
}

/// Preview of a node being dragged or placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhostNode {
    pub id: String,
    pub position: CursorPosition,
}

/// Ephemeral presence of one client.
///
/// Always replaced as a whole: a state without `cursor` clears the cursor.
/// Unknown fields are preserved in `extra` so editor extensions can attach
/// their own presence data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<AwarenessUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ghost_node: Option<GhostNode>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AwarenessState {
    pub fn for_user(user: AwarenessUser) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }
}

/// JSON control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Full replacement of one client's presence. `state: null` removes it.
    Awareness {
        #[serde(rename = "clientId")]
        client_id: ClientId,
        #[serde(default)]
        state: Option<AwarenessState>,
    },
    SyncRequest,
    Ping,
    Pong,
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn awareness(client_id: ClientId, state: Option<AwarenessState>) -> Self {
        ControlMessage::Awareness { client_id, state }
    }

    pub fn is_liveness(&self) -> bool {
        matches!(self, ControlMessage::Ping | ControlMessage::Pong)
    }
}

/// A frame as received from a socket, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Binary(Bytes),
    Text(String),
}

impl Inbound {
    pub fn len(&self) -> usize {
        match self {
            Inbound::Binary(b) => b.len(),
            Inbound::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A frame queued for a socket. Cheap to clone for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Bytes),
    Text(Arc<str>),
}

impl Outbound {
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Outbound::Text(text.into())
    }

    /// Serialize a control message. Serialization of these enums cannot fail
    /// for well-formed states; a failure is logged and yields `None`.
    pub fn control(msg: &ControlMessage) -> Option<Self> {
        match msg.to_json() {
            Ok(json) => Some(Outbound::text(json)),
            Err(e) => {
                log::error!("Failed to encode control message: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_payload_accepts_marker() {
        let frame = [0u8, 1, 2, 3];
        assert_eq!(update_payload(&frame).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_update_payload_rejects_short_and_unknown() {
        assert_eq!(update_payload(&[]), Err(ProtocolError::FrameTooShort(0)));
        assert_eq!(update_payload(&[0]), Err(ProtocolError::FrameTooShort(1)));
        assert_eq!(update_payload(&[7, 0]), Err(ProtocolError::UnknownMarker(7)));
    }

    #[test]
    fn test_encode_update_frame_prefixes_marker() {
        let frame = encode_update_frame(&[9, 9]);
        assert_eq!(&frame[..], &[UPDATE_MARKER, 9, 9]);
        assert_eq!(update_payload(&frame).unwrap(), &[9, 9]);
    }

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"sync-request"}"#).unwrap(),
            ControlMessage::SyncRequest
        );
        assert_eq!(
            ControlMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ControlMessage::Ping
        );
        assert!(ControlMessage::parse(r#"{"type":"bogus"}"#).is_err());
        assert!(ControlMessage::parse("not json").is_err());
    }

    #[test]
    fn test_awareness_message_shapes() {
        let text = json!({
            "type": "awareness",
            "clientId": 42,
            "state": {
                "user": {"id": "u1", "name": "Ada", "color": "#ff0000"},
                "cursor": {"x": 1.0, "y": 2.0},
                "selectedNodeId": "n1",
                "typing": true
            }
        })
        .to_string();

        match ControlMessage::parse(&text).unwrap() {
            ControlMessage::Awareness { client_id, state } => {
                assert_eq!(client_id, ClientId::Num(42));
                let state = state.unwrap();
                assert_eq!(state.user_id(), Some("u1"));
                assert_eq!(state.cursor, Some(CursorPosition { x: 1.0, y: 2.0 }));
                assert_eq!(state.selected_node_id.as_deref(), Some("n1"));
                assert_eq!(state.extra.get("typing"), Some(&json!(true)));
            }
            other => panic!("Expected awareness, got {other:?}"),
        }

        let removal = ControlMessage::parse(r#"{"type":"awareness","clientId":"c","state":null}"#)
            .unwrap();
        assert_eq!(removal, ControlMessage::awareness(ClientId::from("c"), None));
    }

    #[test]
    fn test_absent_fields_are_not_serialized() {
        let state = AwarenessState {
            selection: Some(SelectionRange { anchor: 0, head: 5 }),
            ..AwarenessState::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value, json!({"selection": {"anchor": 0, "head": 5}}));
    }

    #[test]
    fn test_ping_serializes_with_tag() {
        assert_eq!(ControlMessage::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
        assert!(ControlMessage::Pong.is_liveness());
    }
}
