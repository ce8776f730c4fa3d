//! Basic type definitions for the broadcast server
//!
//! Provides newtype wrappers and connection state:
//! - `ConnectionId`: UUID-based unique connection identifier
//! - `ChannelName`: label taken from the upgrade request path
//! - `ConnectionState` / `AtomicConnectionState`: lifecycle of one socket

use std::sync::atomic::{AtomicU8, Ordering};

use uuid::Uuid;

/// Unique connection identifier (newtype pattern)
///
/// Generated by the server for every accepted upgrade, and by the client
/// for its own session. Implements Hash and Eq for use as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical channel label
///
/// Parsed from the request path with the leading `/` removed.
/// Purely a label: routing never depends on it unless the caller
/// asks for a channel-scoped broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName(pub String);

impl ChannelName {
    /// Build a channel name from a request path such as `/Default`
    pub fn from_path(path: &str) -> Self {
        Self(path.trim_start_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a single WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake not yet complete
    Connecting,
    /// Frames flow in both directions
    Open,
    /// We sent Close, waiting for the peer
    CloseSent,
    /// Peer sent Close, our reply is pending
    CloseReceived,
    /// Close handshake finished or socket released
    Closed,
    /// Torn down after a transport error
    Aborted,
}

impl ConnectionState {
    /// Whether the close handshake has started or finished
    pub fn is_closing(self) -> bool {
        !matches!(self, Self::Connecting | Self::Open)
    }
}

/// Atomic wrapper for connection state.
///
/// Shared between the receive loop (the writer of most transitions) and
/// the broadcaster (which only reads it).
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::CloseSent,
            3 => ConnectionState::CloseReceived,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Aborted,
        }
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `current` to `new` only if the state is still `current`.
    ///
    /// Returns true when the transition happened.
    pub fn transition(&self, current: ConnectionState, new: ConnectionState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
