//! Server and client configuration
//!
//! Plain structs with defaults matching the demo setup and `with_*`
//! builders for everything a test or binary wants to override.

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Default listen / connect port
pub const DEFAULT_PORT: u16 = 25410;

/// Default channel label used by the client
pub const DEFAULT_CHANNEL: &str = "Default";

/// Socket read chunk size (1 MiB)
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 1024 * 1024;

/// Largest HTTP request head read before the upgrade decision
pub const DEFAULT_MAX_HEAD_SIZE: usize = 8 * 1024;

/// Upper bound on a single outbound frame write
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the transport settings for a given receive buffer.
///
/// The buffer only sizes each socket read. Messages larger than one buffer
/// are reassembled by the transport up to its own message limits.
pub fn websocket_config(receive_buffer_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.read_buffer_size = receive_buffer_size;
    config
}

/// Broadcast server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host part of the listen address (wildcard by default)
    pub bind_addr: String,
    /// Listen port
    pub port: u16,
    /// Bytes read from the socket at a time
    pub receive_buffer_size: usize,
    /// Request head limit for non-upgrade detection
    pub max_head_size: usize,
    /// Timeout for one frame write during broadcast
    pub send_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>, port: u16) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            port,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_max_head_size(mut self, size: usize) -> Self {
        self.max_head_size = size;
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// `host:port` string handed to the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn websocket(&self) -> WebSocketConfig {
        websocket_config(self.receive_buffer_size)
    }
}

/// Listening client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Channel label placed in the request path
    pub channel: String,
    /// Self-reported identity sent as the `ClientName` cookie
    pub identity: String,
    /// Bytes read from the socket at a time
    pub receive_buffer_size: usize,
    /// Timeout for one frame write
    pub send_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            channel: DEFAULT_CHANNEL.to_string(),
            identity: machine_name(),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        channel: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            channel: channel.into(),
            identity: identity.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// `ws://<host>:<port>/<channel>`
    pub fn url(&self) -> String {
        format!("ws://{}:{}/{}", self.host, self.port, self.channel)
    }

    pub fn websocket(&self) -> WebSocketConfig {
        websocket_config(self.receive_buffer_size)
    }
}

/// Local machine name, used as the default client identity
pub fn machine_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}
