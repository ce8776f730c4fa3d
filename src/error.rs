//! Error types for the broadcast server and client
//!
//! One enum per failure class of the connection lifecycle, plus an
//! application-level `AppError` that wraps them all.
//! Uses thiserror for ergonomic error definitions.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::types::ConnectionState;

/// Client connect/handshake failure
///
/// Surfaced to whoever called `connect`. Never retried automatically.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The target URI or identity header could not be built
    #[error("Invalid connection target: {0}")]
    InvalidTarget(String),

    /// TCP connect or WebSocket upgrade failed
    #[error("Handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    /// The session already owns a live connection
    #[error("Session is already connected")]
    AlreadyConnected,
}

/// Failure while reading a frame
///
/// Ends the owning receive loop after a best-effort close.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Transport reset, protocol violation or abrupt peer close
    #[error("Receive failed: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Failure sending a single frame to a single connection
///
/// Always isolated to the connection it happened on.
#[derive(Debug, Error)]
pub enum SendError {
    /// Connection is not in a state that accepts data frames
    #[error("Connection not open (state: {0:?})")]
    NotOpen(ConnectionState),

    /// Send did not complete within the configured timeout
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// Underlying transport rejected the frame
    #[error("Send failed: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Upgrade request rejected because of bad identity metadata
///
/// Aborts only the offending connection's setup.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// `ClientName` cookie missing or empty
    #[error("Client name is empty for request {0}")]
    MissingIdentity(String),

    /// `ClientName` cookie is not valid percent-encoded UTF-8
    #[error("Client name is not valid: {0}")]
    InvalidIdentity(String),
}

/// Listener could not bind its port (fatal at startup)
#[derive(Debug, Error)]
#[error("Failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}

/// Application-level errors
///
/// Per-connection variants are logged and contained at the connection
/// boundary; only `Bind` is process-fatal.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Receive(#[from] ReceiveError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Bind(#[from] BindError),

    /// WebSocket protocol error during the server handshake
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Payload serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
