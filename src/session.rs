//! Client session
//!
//! Connects to the broadcast server with the identity cookie, then runs
//! the receive loop on its own task. When the loop exits for any reason
//! the connection is released and the session forgets it, so `connect`
//! can be called again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ConnectError, SendError};
use crate::message::{close_frame, BinaryPolicy};
use crate::receive::{await_close_reply, run_receive_loop, LoopExit};
use crate::transport::identity_cookie;
use crate::types::{ChannelName, ConnectionId};

type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

/// A reconnectable client session
///
/// Holds at most one live connection at a time.
#[derive(Debug)]
pub struct ClientSession {
    config: ClientConfig,
    current: Slot,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a receive loop is currently running for this session
    pub fn is_connected(&self) -> bool {
        lock(&self.current).is_some()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        lock(&self.current).clone()
    }

    /// Connect to `ws://<host>:<port>/<channel>` and start listening.
    pub async fn connect(&self) -> Result<SessionHandle, ConnectError> {
        if self.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }

        let request = build_request(&self.config)?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async_with_config(
            request,
            Some(self.config.websocket()),
            false,
        )
        .await
        .map_err(ConnectError::Handshake)?;

        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let connection = Arc::new(Connection::new(
            ConnectionId::new(),
            Some(self.config.identity.clone()),
            ChannelName::from_path(&self.config.channel),
            ws_sender,
            self.config.send_timeout,
        ));

        {
            let mut slot = lock(&self.current);
            if slot.is_some() {
                // Lost a race with a concurrent connect
                return Err(ConnectError::AlreadyConnected);
            }
            *slot = Some(Arc::clone(&connection));
        }

        info!(
            connection_id = %connection.id(),
            url = %self.config.url(),
            identity = %self.config.identity,
            "Connected"
        );

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let slot = Arc::clone(&self.current);
        let conn = Arc::clone(&connection);
        let send_timeout = self.config.send_timeout;

        let task = tokio::spawn(async move {
            let exit = run_receive_loop(&mut ws_receiver, &conn, BinaryPolicy::Ignore, |text| {
                info!(
                    connection_id = %conn.id(),
                    "{} Received:{}",
                    Local::now().format("%H:%M:%S %3f"),
                    text
                );
                let _ = inbox_tx.send(text);
            })
            .await;

            if let LoopExit::Failed(e) = &exit {
                warn!(connection_id = %conn.id(), "Client receive error: {}", e);
            }
            if exit.awaits_close_reply() {
                await_close_reply(&mut ws_receiver, &conn, send_timeout).await;
            }

            conn.release().await;
            {
                let mut current = lock(&slot);
                if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn)) {
                    *current = None;
                }
            }

            info!(connection_id = %conn.id(), ?exit, "Disconnected");
            exit
        });

        Ok(SessionHandle {
            connection,
            inbox: inbox_rx,
            task,
        })
    }
}

/// Handle to one connected session
#[derive(Debug)]
pub struct SessionHandle {
    connection: Arc<Connection>,
    inbox: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<LoopExit>,
}

impl SessionHandle {
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Next text message, or `None` once the receive loop has ended
    pub async fn recv(&mut self) -> Option<String> {
        self.inbox.recv().await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.connection.send_text(text).await
    }

    /// Start the close handshake; the receive loop ends on the server's reply
    pub async fn close(&self) -> Result<(), SendError> {
        self.connection
            .send_close(close_frame(CloseCode::Normal, "client closing"))
            .await
    }

    /// Wait for the receive loop to finish
    pub async fn join(self) -> Result<LoopExit, JoinError> {
        self.task.await
    }
}

fn build_request(config: &ClientConfig) -> Result<Request, ConnectError> {
    let mut request = config
        .url()
        .into_client_request()
        .map_err(|e| ConnectError::InvalidTarget(e.to_string()))?;

    let cookie = HeaderValue::from_str(&identity_cookie(&config.identity))
        .map_err(|e| ConnectError::InvalidTarget(e.to_string()))?;
    request.headers_mut().insert(COOKIE, cookie);

    Ok(request)
}

fn lock(slot: &Mutex<Option<Arc<Connection>>>) -> MutexGuard<'_, Option<Arc<Connection>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
