//! Connection handle
//!
//! A `Connection` is the shareable half of one WebSocket: metadata,
//! lifecycle state and the write side. The read side stays with the
//! receive loop that owns the socket. Writers from different tasks
//! (the receive loop closing, the broadcaster fanning out) are serialized
//! by a per-connection mutex around the sink.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::error::SendError;
use crate::types::{AtomicConnectionState, ChannelName, ConnectionId, ConnectionState};

/// Write half of a WebSocket, boxed so server and client share one type
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// A live WebSocket connection as seen by everyone except its reader
pub struct Connection {
    id: ConnectionId,
    identity: Option<String>,
    channel: ChannelName,
    state: AtomicConnectionState,
    sink: Mutex<FrameSink>,
    send_timeout: Duration,
    released: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("channel", &self.channel)
            .field("state", &self.state.load())
            .finish()
    }
}

impl Connection {
    /// Wrap the write half of a freshly opened WebSocket
    pub fn new<S>(
        id: ConnectionId,
        identity: Option<String>,
        channel: ChannelName,
        sink: S,
        send_timeout: Duration,
    ) -> Self
    where
        S: Sink<Message, Error = tungstenite::Error> + Send + 'static,
    {
        Self {
            id,
            identity,
            channel,
            state: AtomicConnectionState::new(ConnectionState::Open),
            sink: Mutex::new(Box::pin(sink)),
            send_timeout,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer-declared identity, if the peer sent one
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Send one text frame. Fails without writing unless the connection is open.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(SendError::NotOpen(state));
        }
        let text: String = text.into();
        self.write(Message::Text(text.into())).await
    }

    /// Send a Close frame and advance the close handshake.
    ///
    /// Valid while open (we initiate) or after the peer's Close (we reply).
    pub async fn send_close(&self, frame: CloseFrame<'static>) -> Result<(), SendError> {
        let initiated = self
            .state
            .transition(ConnectionState::Open, ConnectionState::CloseSent);
        if !initiated {
            let state = self.state();
            if state != ConnectionState::CloseReceived {
                return Err(SendError::NotOpen(state));
            }
        }

        let result = self.write(Message::Close(Some(frame))).await;
        match &result {
            Ok(()) if !initiated => self.state.store(ConnectionState::Closed),
            Ok(()) => {}
            Err(_) => self.state.store(ConnectionState::Aborted),
        }
        result
    }

    /// Record that the peer's Close frame arrived
    pub fn mark_close_received(&self) {
        if !self
            .state
            .transition(ConnectionState::Open, ConnectionState::CloseReceived)
        {
            // Answer to our own Close
            self.state
                .transition(ConnectionState::CloseSent, ConnectionState::Closed);
        }
    }

    /// Record a transport failure
    pub fn mark_aborted(&self) {
        self.state.store(ConnectionState::Aborted);
    }

    /// Flush and close the write half. Runs at most once per connection.
    ///
    /// Any pending Close reply is flushed here; if the connection is still
    /// open a bare Close frame goes out.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let closed = tokio::time::timeout(self.send_timeout, async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        })
        .await;

        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection_id = %self.id, "Close on release failed: {}", e),
            Err(_) => debug!(connection_id = %self.id, "Close on release timed out"),
        }

        if self.state() != ConnectionState::Aborted {
            self.state.store(ConnectionState::Closed);
        }
    }

    async fn write(&self, msg: Message) -> Result<(), SendError> {
        let sent = tokio::time::timeout(self.send_timeout, async {
            let mut sink = self.sink.lock().await;
            sink.send(msg).await
        })
        .await;

        match sent {
            Ok(result) => result.map_err(SendError::from),
            Err(_) => Err(SendError::Timeout(self.send_timeout)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use futures_util::sink;
    use tokio::sync::mpsc;

    use super::*;

    /// Sink that forwards every frame into a channel
    pub fn recording_sink(
        tx: mpsc::UnboundedSender<Message>,
    ) -> impl Sink<Message, Error = tungstenite::Error> + Send + 'static {
        sink::unfold(tx, |tx, msg: Message| async move {
            let _ = tx.send(msg);
            Ok::<_, tungstenite::Error>(tx)
        })
    }

    /// Sink that accepts and drops every frame
    pub fn null_sink() -> impl Sink<Message, Error = tungstenite::Error> + Send + 'static {
        sink::drain::<Message>().sink_map_err(|never| match never {})
    }

    /// Sink whose every send fails as if the peer reset
    pub fn failing_sink() -> impl Sink<Message, Error = tungstenite::Error> + Send + 'static {
        null_sink().with(|_msg: Message| async move {
            Err::<Message, _>(tungstenite::Error::ConnectionClosed)
        })
    }

    /// Sink that never completes a send
    pub fn stalled_sink() -> impl Sink<Message, Error = tungstenite::Error> + Send + 'static {
        sink::unfold((), |(), _msg: Message| {
            futures_util::future::pending::<Result<(), tungstenite::Error>>()
        })
    }

    pub fn open_connection<S>(sink: S) -> Connection
    where
        S: Sink<Message, Error = tungstenite::Error> + Send + 'static,
    {
        Connection::new(
            ConnectionId::new(),
            Some("dev1".to_string()),
            ChannelName::from_path("/Default"),
            sink,
            Duration::from_millis(200),
        )
    }
}
