//! WebSocket Broadcast Library
//!
//! A minimal two-sided WebSocket demo built with tokio-tungstenite: a
//! server that tracks every connected client and broadcasts to all of
//! them, and a client that identifies itself and listens.
//!
//! # Features
//! - Plain HTTP requests answered with `400`
//! - Client identity via the `ClientName` cookie, validated per connection
//! - Concurrent connection registry with guaranteed deregistration
//! - Fan-out broadcast isolated from slow or failing peers
//! - Binary frames rejected by the server, ignored by the client
//! - Graceful shutdown of every connection
//!
//! # Architecture
//! - `BroadcastServer` owns the listener and runs the accept loop
//! - Each TCP connection gets a supervised `handler` task that owns the
//!   socket's read half and runs the shared receive loop
//! - The `ConnectionRegistry` holds the write halves; writers are
//!   serialized per connection
//! - `Broadcaster` snapshots the registry and writes to each connection
//!   independently
//!
//! # Example
//! ```ignore
//! use ws_broadcast::{BroadcastServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = BroadcastServer::bind(ServerConfig::default()).await.unwrap();
//!     let broadcaster = server.broadcaster();
//!
//!     tokio::spawn(server.run());
//!
//!     broadcaster.broadcast("test", "hello from server").await.unwrap();
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod receive;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use broadcast::{BroadcastReport, Broadcaster};
pub use config::{ClientConfig, ServerConfig};
pub use connection::Connection;
pub use error::{AppError, BindError, ConnectError, ReceiveError, SendError, ValidationError};
pub use handler::handle_connection;
pub use message::{BinaryPolicy, InboundMessage, OutboundBroadcast};
pub use receive::LoopExit;
pub use registry::ConnectionRegistry;
pub use server::BroadcastServer;
pub use session::{ClientSession, SessionHandle};
pub use types::{ChannelName, ConnectionId, ConnectionState};
