//! BroadcastServer implementation
//!
//! Owns the listener and the connection registry. The accept loop spawns
//! one supervised task per TCP connection into a `JoinSet`; a task that
//! fails or panics is logged and reaped without touching the loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::error::{AppError, BindError};
use crate::handler::handle_connection;
use crate::message::close_frame;
use crate::registry::ConnectionRegistry;

/// How long shutdown waits for connections to finish their close handshake
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The WebSocket broadcast server
pub struct BroadcastServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    config: Arc<ServerConfig>,
}

impl BroadcastServer {
    /// Bind the listener. Failure here is fatal and never retried.
    pub async fn bind(config: ServerConfig) -> Result<Self, BindError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| BindError { addr, source })?;

        Ok(Self {
            listener,
            registry: Arc::new(ConnectionRegistry::new()),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared registry, for inspection or custom broadcasting
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Broadcaster over this server's registry
    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(self.registry())
    }

    /// Accept connections forever
    pub async fn run(self) {
        self.run_until(std::future::pending()).await;
    }

    /// Accept connections until `shutdown` completes, then close every
    /// registered connection with Going Away.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("BroadcastServer started");

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let registry = Arc::clone(&self.registry);
                            let config = Arc::clone(&self.config);
                            tasks.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, registry, config).await {
                                    log_connection_error(peer, &e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task ended abnormally: {}", e);
                    }
                }
            }
        }

        self.shutdown(tasks).await;
        info!("BroadcastServer shutting down");
    }

    async fn shutdown(&self, mut tasks: JoinSet<()>) {
        let connections = self.registry.snapshot();
        debug!(count = connections.len(), "Closing registered connections");

        let closes = connections.iter().map(|conn| async move {
            if let Err(e) = conn
                .send_close(close_frame(CloseCode::Away, "server shutting down"))
                .await
            {
                debug!(connection_id = %conn.id(), "Shutdown close failed: {}", e);
            }
        });
        join_all(closes).await;

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = tasks.len(), "Aborting connections that did not close in time");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

fn log_connection_error(peer: SocketAddr, err: &AppError) {
    match err {
        AppError::Validation(e) => warn!(peer = %peer, "Upgrade rejected: {}", e),
        AppError::Io(e) => debug!(peer = %peer, "Connection dropped before upgrade: {}", e),
        e => error!(peer = %peer, "Connection handler error: {}", e),
    }
}
