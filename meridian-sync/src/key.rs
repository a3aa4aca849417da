//! Room identity: `(room_type, room_id)`.
//!
//! Both halves arrive from the URL (`/rooms/{room_id}/ws?type={room_type}`),
//! so they are validated once at the edge and carried as newtypes afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const MAX_TYPE_LEN: usize = 64;
const MAX_ID_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} contains invalid character {ch:?}")]
    InvalidChar { field: &'static str, ch: char },
}

fn validate(field: &'static str, value: &str, max: usize) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty { field });
    }
    if value.len() > max {
        return Err(KeyError::TooLong { field, max });
    }
    match value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        Some(ch) => Err(KeyError::InvalidChar { field, ch }),
        None => Ok(()),
    }
}

/// Structure kind of a room (`flow`, `page`, `text`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomType(String);

impl RoomType {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        validate("room type", &value, MAX_TYPE_LEN)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomType {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomType> for String {
    fn from(value: RoomType) -> Self {
        value.0
    }
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a single room within its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        validate("room id", &value, MAX_ID_LEN)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique key of a room. One live room exists per key per process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomKey {
    pub room_type: RoomType,
    pub room_id: RoomId,
}

impl RoomKey {
    pub fn new(room_type: RoomType, room_id: RoomId) -> Self {
        Self { room_type, room_id }
    }

    /// Validate raw strings from a request.
    pub fn parse(room_type: &str, room_id: &str) -> Result<Self, KeyError> {
        Ok(Self::new(RoomType::new(room_type)?, RoomId::new(room_id)?))
    }

    /// Storage key. `/` cannot appear in either half, so the encoding is unambiguous.
    pub fn storage_key(&self) -> Vec<u8> {
        format!("{}/{}", self.room_type, self.room_id).into_bytes()
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room_type, self.room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_key() {
        let key = RoomKey::parse("flow", "r1").unwrap();
        assert_eq!(key.room_type.as_str(), "flow");
        assert_eq!(key.room_id.as_str(), "r1");
        assert_eq!(key.to_string(), "flow:r1");
        assert_eq!(key.storage_key(), b"flow/r1".to_vec());
    }

    #[test]
    fn test_rejects_empty_and_separators() {
        assert_eq!(
            RoomType::new(""),
            Err(KeyError::Empty { field: "room type" })
        );
        assert_eq!(
            RoomId::new("a/b"),
            Err(KeyError::InvalidChar { field: "room id", ch: '/' })
        );
        assert!(RoomId::new("x".repeat(129)).is_err());
        assert!(RoomId::new("page_42-draft").is_ok());
    }

    #[test]
    fn test_serde_validates() {
        let ok: RoomType = serde_json::from_str("\"text\"").unwrap();
        assert_eq!(ok.as_str(), "text");
        assert!(serde_json::from_str::<RoomType>("\"bad type\"").is_err());
    }
}
