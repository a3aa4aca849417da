//! Client side of a room connection.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with capped backoff)
//! - Local yrs replica kept in sync with the room
//! - Awareness table of the other clients
//! - Full local state resent on every open, so offline edits are not lost
//!
//! [`ConnectionCore`] is the pure state machine; [`Connection`] runs it on
//! tokio over tokio-tungstenite.

pub mod backoff;
pub mod connection;
pub mod machine;
pub mod scheduler;

pub use backoff::Backoff;
pub use connection::Connection;
pub use machine::{
    room_url, Command, ConnectionCore, ConnectionError, ConnectionStatus, ConnectionView,
    LocalDoc,
};
pub use scheduler::{ManualScheduler, ReconnectScheduler, TokioScheduler};
